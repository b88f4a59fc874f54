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

//! # quorum metrics
//!
//! quorum uses [OpenTelemetry] to collect & export metrics. Instruments are meant to be created
//! once & re-used, and the same metric name must never name two different instruments. Rather
//! than keep a central list, each module registers the metrics it uses at the point of use via
//! David Tolnay's [inventory] crate:
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("commits.applied", Sort::IntegralCounter) }
//! // ...
//! counter_add!(instruments, "commits.applied", 1, &[]);
//! ```
//!
//! [Instruments::new] walks the registrations, panics on a name clash, and pre-builds every
//! instrument so that recording needs only `&self`.
//!
//! Looking-up a name that was never registered (or that names an instrument of a different sort)
//! panics. These are logic errors, and a name clash is caught the first time the process starts.

use std::collections::{hash_map::Entry, HashMap, HashSet};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};

/// What kind of instrument a metric name denotes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Sort {
    /// `Counter<u64>`
    IntegralCounter,
    /// `Gauge<u64>`
    IntegralGauge,
    /// `Histogram<f64>`, in seconds
    Latency,
}

/// One module's claim on a metric name
#[derive(Clone, Debug, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
    fn build(&self, meter: &Meter) -> Instrument {
        match self.sort {
            Sort::IntegralCounter => Instrument::Counter(meter.u64_counter(self.name).build()),
            Sort::IntegralGauge => Instrument::Gauge(meter.u64_gauge(self.name).build()),
            Sort::Latency => Instrument::Latency(
                meter
                    .f64_histogram(self.name)
                    .with_unit("s")
                    .build(),
            ),
        }
    }
}

inventory::collect!(Registration);

/// Panic if any metric name has been registered twice
pub fn check_metric_names() {
    let mut names: HashSet<&'static str> = HashSet::new();
    for reg in inventory::iter::<Registration> {
        if !names.insert(reg.name()) {
            panic!("The metric name {} was registered twice", reg.name());
        }
    }
}

enum Instrument {
    Counter(Counter<u64>),
    Gauge(Gauge<u64>),
    Latency(Histogram<f64>),
}

/// Every registered instrument, by name
pub struct Instruments {
    map: HashMap<&'static str, Instrument>,
}

impl Instruments {
    /// Build all registered instruments from the global meter provider's meter `scope`
    pub fn new(scope: &'static str) -> Instruments {
        let meter = global::meter(scope);
        let mut map = HashMap::new();
        for reg in inventory::iter::<Registration> {
            match map.entry(reg.name()) {
                Entry::Occupied(_) => panic!("The metric name {} was used twice", reg.name()),
                Entry::Vacant(entry) => {
                    entry.insert(reg.build(&meter));
                }
            }
        }
        Instruments { map }
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::Counter(c)) => c.add(count, attributes),
            _ => panic!("{} does not name a counter", name),
        }
    }
    pub fn set(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::Gauge(g)) => g.record(value, attributes),
            _ => panic!("{} does not name a gauge", name),
        }
    }
    pub fn observe(&self, name: &str, elapsed: std::time::Duration, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::Latency(h)) => h.record(elapsed.as_secs_f64(), attributes),
            _ => panic!("{} does not name a latency histogram", name),
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs);
    };
}

#[macro_export]
macro_rules! gauge_set {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.set($name, $value, $attrs);
    };
}

#[macro_export]
macro_rules! latency_observe {
    ($instr:expr, $name:expr, $elapsed:expr, $attrs:expr) => {
        $instr.observe($name, $elapsed, $attrs);
    };
}
