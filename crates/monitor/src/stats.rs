#![forbid(unsafe_code)]

use config::ObjectClass;
use std::fmt;

/// Event counters kept by the write classifier.
///
/// Only the poll thread writes these, and they are only read once it has
/// stopped polling, so plain integers suffice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    pub monitored_total: u64,
    pub irrelevant_total: u64,
    pub per_class: [u64; ObjectClass::ALL.len()],
    pub rearm_failures: u64,
}

impl Statistics {
    /// Count one monitored write, attributed to each of `classes`.
    pub fn record_hit(&mut self, classes: &[ObjectClass]) {
        self.monitored_total += 1;
        for class in classes {
            self.per_class[class.index()] += 1;
        }
    }

    pub fn record_irrelevant(&mut self) {
        self.irrelevant_total += 1;
    }

    pub fn hits(&self, class: ObjectClass) -> u64 {
        self.per_class[class.index()]
    }

    /// Irrelevant writes per monitored write, in percent. Zero when nothing
    /// was monitored; may exceed 100.
    pub fn irrelevant_percentage(&self) -> f64 {
        if self.monitored_total == 0 {
            return 0.0;
        }
        self.irrelevant_total as f64 / self.monitored_total as f64 * 100.0
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Monitored writes:  {}", self.monitored_total)?;
        writeln!(f, "Irrelevant writes: {}", self.irrelevant_total)?;
        write!(f, "Irrelevant ratio:  {:.2}%", self.irrelevant_percentage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn nothing_monitored_reports_zero() {
        let stats = Statistics {
            irrelevant_total: 12,
            ..Default::default()
        };
        assert_eq!(stats.irrelevant_percentage(), 0.0);
    }

    #[test]
    fn hits_are_tallied_per_class() {
        let mut stats = Statistics::default();
        stats.record_hit(&[ObjectClass::Module]);
        stats.record_hit(&[ObjectClass::Module]);
        stats.record_hit(&[ObjectClass::OpenFiles]);
        stats.record_irrelevant();

        assert_eq!(stats.monitored_total, 3);
        assert_eq!(stats.hits(ObjectClass::Module), 2);
        assert_eq!(stats.hits(ObjectClass::Process), 0);
        assert_eq!(
            stats.to_string(),
            "Monitored writes:  3\nIrrelevant writes: 1\nIrrelevant ratio:  33.33%"
        );
    }

    #[test]
    fn aliased_write_counts_once_but_for_every_class() {
        let mut stats = Statistics::default();
        stats.record_hit(&[ObjectClass::OpenFiles, ObjectClass::Process]);

        assert_eq!(stats.monitored_total, 1);
        assert_eq!(stats.hits(ObjectClass::OpenFiles), 1);
        assert_eq!(stats.hits(ObjectClass::Process), 1);
    }

    proptest! {
        #[test]
        fn percentage_is_irrelevant_over_monitored(monitored in 0u64..10_000, irrelevant in 0u64..10_000) {
            let mut stats = Statistics::default();
            for _ in 0..monitored {
                stats.record_hit(&[ObjectClass::Process]);
            }
            for _ in 0..irrelevant {
                stats.record_irrelevant();
            }

            let expected = if monitored == 0 {
                0.0
            } else {
                irrelevant as f64 / monitored as f64 * 100.0
            };
            prop_assert_eq!(stats.irrelevant_percentage(), expected);
        }
    }
}
