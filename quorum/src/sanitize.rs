// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of quorum.
//
// quorum is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// quorum is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with quorum.  If not,
// see <http://www.gnu.org/licenses/>.

//! Free-text sanitization.
//!
//! Every free-text field that arrives from outside (survey titles, question & option text, text
//! answers) passes through [sanitize] before it's stored. We strip the elements that can carry
//! active content (`script`, `iframe`, `object`, `embed`, `link` & `style`) along with control
//! characters & nulls, then trim. Everything else is left alone; escaping for display is the
//! renderer's business.

use lazy_static::lazy_static;
use regex::Regex;

const DANGEROUS: &[&str] = &["script", "iframe", "object", "embed", "style"];

lazy_static! {
    // The regex crate has no back-references, so one pattern per element for the paired form.
    static ref PAIRED: Vec<Regex> = DANGEROUS
        .iter()
        .map(|tag| {
            Regex::new(&format!(r"(?is)<\s*{tag}\b[^>]*>.*?<\s*/\s*{tag}\s*>"))
                .unwrap(/* known good */)
        })
        .collect();
    static ref LONE: Regex =
        Regex::new(r"(?i)<\s*/?\s*(script|iframe|object|embed|link|style)\b[^>]*>?")
            .unwrap(/* known good */);
}

fn strip_once(text: &str) -> String {
    let mut out = text.to_owned();
    for re in PAIRED.iter() {
        out = re.replace_all(&out, "").into_owned();
    }
    let out = LONE.replace_all(&out, "");
    out.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Strip dangerous markup & control characters from `text`, then trim it.
///
/// Removal is repeated until nothing changes, so that fragments like `<scr<script>ipt>` can't
/// reassemble themselves into a tag. The result is idempotent: `sanitize(sanitize(x)) ==
/// sanitize(x)`.
pub fn sanitize(text: &str) -> String {
    let mut current = text.to_owned();
    loop {
        let next = strip_once(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current.trim().to_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strips_active_content() {
        assert_eq!(sanitize("  Favorite color?  "), "Favorite color?");
        assert_eq!(sanitize("Hi<script>alert(1)</script> there"), "Hi there");
        assert_eq!(sanitize("<SCRIPT type=\"x\">\nevil()\n</Script >ok"), "ok");
        assert_eq!(sanitize("a<iframe src=x></iframe>b"), "ab");
        assert_eq!(sanitize("<link rel=stylesheet href=x>text"), "text");
        assert_eq!(sanitize("x<style>body{}</style>y"), "xy");
        assert_eq!(sanitize("nul\u{0}byte\u{7}s"), "nulbytes");
        assert_eq!(sanitize("line one\nline\ttwo"), "line one\nline\ttwo");
        // Ordinary markup is someone else's problem
        assert_eq!(sanitize("<b>bold</b> & <i>co</i>"), "<b>bold</b> & <i>co</i>");
    }

    #[test]
    fn fixed_point() {
        assert_eq!(sanitize("<scr<script>ipt>alert(1)"), "alert(1)");
        assert_eq!(sanitize("<scri<script></script>pt>x</script>"), "x");
        assert_eq!(sanitize("<script>unterminated"), "unterminated");
        for text in ["<scr<script>ipt>", " a\u{0} ", "<embed src=x> b"] {
            let once = sanitize(text);
            assert_eq!(sanitize(&once), once);
        }
        assert_eq!(sanitize("<script></script>\u{0}  "), "");
    }
}
