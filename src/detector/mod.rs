//! Per-choice repeat detection for streamed completions
//!
//! Each `choice.index` in a streamed response gets its own [`RepeatDetector`],
//! created on first sight and fed the generated text of every delta. The
//! detectors for one response live together in a [`RepeatDetectors`] set and
//! all go back to their pools when the set is dropped.

mod repeat;

pub use repeat::SuffixAutomaton;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::pool::{Pool, Pooled};

/// Thresholds for declaring a choice degenerate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RepeatSettings {
    /// Repeatness below this value counts as repeating
    pub threshold: f64,
    /// The ratio is only trusted once more than this many characters were seen
    pub min_length: u32,
}

impl RepeatSettings {
    /// True when an automaton is long enough and repetitive enough to abort
    pub fn is_repeating(&self, automaton: &SuffixAutomaton) -> bool {
        automaton.len() > self.min_length && automaton.repeatness() < self.threshold
    }
}

/// Detection state for a single choice index
pub struct RepeatDetector {
    automaton: Pooled<SuffixAutomaton>,
    finish_reason: Option<String>,
}

impl RepeatDetector {
    #[cfg(test)]
    pub fn automaton(&self) -> &SuffixAutomaton {
        &self.automaton
    }

    /// Whether this choice has already reported a finish reason
    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Map of choice index to detector, checked out of a pool for one response
pub type DetectorMap = BTreeMap<u32, RepeatDetector>;

/// All detectors for one streamed response
pub struct RepeatDetectors {
    detectors: Pooled<DetectorMap>,
    automata: Arc<Pool<SuffixAutomaton>>,
}

impl RepeatDetectors {
    pub fn new(maps: &Arc<Pool<DetectorMap>>, automata: &Arc<Pool<SuffixAutomaton>>) -> Self {
        Self {
            detectors: maps.checkout(),
            automata: Arc::clone(automata),
        }
    }

    /// Feed one delta for `index` and report whether that choice now repeats
    ///
    /// A non-empty `finish_reason` is remembered for the choice so it is left
    /// out of [`unfinished`](Self::unfinished) afterwards.
    pub fn observe(
        &mut self,
        index: u32,
        finish_reason: Option<&str>,
        content: &str,
        settings: &RepeatSettings,
    ) -> bool {
        let automata = &self.automata;
        let detector = self
            .detectors
            .entry(index)
            .or_insert_with(|| RepeatDetector {
                automaton: automata.checkout(),
                finish_reason: None,
            });

        if let Some(reason) = finish_reason.filter(|r| !r.is_empty()) {
            detector.finish_reason = Some(reason.to_string());
        }

        detector.automaton.add_str(content);
        settings.is_repeating(&detector.automaton)
    }

    /// Indices that have not reported a finish reason yet, in ascending order
    pub fn unfinished(&self) -> Vec<u32> {
        self.detectors
            .iter()
            .filter(|(_, d)| !d.is_finished())
            .map(|(index, _)| *index)
            .collect()
    }

    #[cfg(test)]
    pub fn get(&self, index: u32) -> Option<&RepeatDetector> {
        self.detectors.get(&index)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.detectors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DEFAULT_MAX_IDLE;

    fn pools() -> (Arc<Pool<DetectorMap>>, Arc<Pool<SuffixAutomaton>>) {
        (Pool::new(DEFAULT_MAX_IDLE), Pool::new(DEFAULT_MAX_IDLE))
    }

    const SETTINGS: RepeatSettings = RepeatSettings {
        threshold: 0.5,
        min_length: 20,
    };

    #[test]
    fn test_repeating_choice_is_flagged() {
        let (maps, automata) = pools();
        let mut detectors = RepeatDetectors::new(&maps, &automata);

        let mut flagged = false;
        for _ in 0..30 {
            flagged = detectors.observe(0, None, "ha", &SETTINGS);
            if flagged {
                break;
            }
        }
        assert!(flagged);
        assert!(detectors.get(0).unwrap().automaton().len() > SETTINGS.min_length);
    }

    #[test]
    fn test_short_text_is_never_flagged() {
        let (maps, automata) = pools();
        let mut detectors = RepeatDetectors::new(&maps, &automata);
        // Highly repetitive but not longer than min_length
        assert!(!detectors.observe(0, None, &"a".repeat(20), &SETTINGS));
    }

    #[test]
    fn test_varied_text_is_not_flagged() {
        let (maps, automata) = pools();
        let mut detectors = RepeatDetectors::new(&maps, &automata);
        let text = "The quick brown fox jumps over the lazy dog while seven wizards quietly hex jumbled pianos.";
        assert!(!detectors.observe(0, None, text, &SETTINGS));
    }

    #[test]
    fn test_choices_are_tracked_independently() {
        let (maps, automata) = pools();
        let mut detectors = RepeatDetectors::new(&maps, &automata);

        detectors.observe(1, None, "abc", &SETTINGS);
        detectors.observe(0, None, "xy", &SETTINGS);
        detectors.observe(1, None, "d", &SETTINGS);

        assert_eq!(detectors.len(), 2);
        assert_eq!(detectors.get(0).unwrap().automaton().len(), 2);
        assert_eq!(detectors.get(1).unwrap().automaton().len(), 4);
    }

    #[test]
    fn test_unfinished_skips_choices_with_finish_reason() {
        let (maps, automata) = pools();
        let mut detectors = RepeatDetectors::new(&maps, &automata);

        detectors.observe(2, None, "a", &SETTINGS);
        detectors.observe(0, None, "b", &SETTINGS);
        detectors.observe(1, Some("stop"), "", &SETTINGS);
        detectors.observe(0, Some(""), "c", &SETTINGS);

        assert_eq!(detectors.unfinished(), vec![0, 2]);
    }

    #[test]
    fn test_automata_return_to_pool_cleared() {
        let (maps, automata) = pools();
        {
            let mut detectors = RepeatDetectors::new(&maps, &automata);
            detectors.observe(0, None, "hello", &SETTINGS);
            detectors.observe(1, None, "world", &SETTINGS);
        }
        assert_eq!(maps.idle(), 1);
        // Detector map was cleared, which dropped both pooled automata
        assert_eq!(automata.idle(), 2);

        let sam = automata.checkout();
        assert!(sam.is_empty());
    }
}
