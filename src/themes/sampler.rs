//! Topic sampling without replacement.
//!
//! Each (theme, language) pair gets a shuffled deck drawn from its topic
//! pool. Decks are keyed by the identifier the locale was resolved under,
//! so `builtin:<id>` and a user-merged `<id>` never share one. A deck is only refilled once exhausted, and the first topic of a
//! fresh deck is never the one drawn last.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::LocaleConfig;

#[derive(Debug, Default)]
struct Deck {
    remaining: Vec<String>,
    last: Option<String>,
}

#[derive(Debug)]
struct SamplerState {
    rng: StdRng,
    decks: HashMap<(String, String), Deck>,
}

/// Session-scoped topic sampler, shared by every job of a process
#[derive(Debug)]
pub struct TopicSampler {
    state: Mutex<SamplerState>,
}

impl Default for TopicSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicSampler {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Deterministic sampler for tests
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            state: Mutex::new(SamplerState {
                rng,
                decks: HashMap::new(),
            }),
        }
    }

    /// Draw the next topic for a locale; `None` only for an empty pool
    pub fn next(&self, locale: &LocaleConfig) -> Option<String> {
        if locale.topics.is_empty() {
            return None;
        }

        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let SamplerState { rng, decks } = &mut *guard;

        let deck = decks
            .entry((locale.theme.clone(), locale.language.clone()))
            .or_default();

        if deck.remaining.is_empty() {
            let mut fresh = locale.topics.clone();
            fresh.shuffle(rng);
            // Drawn from the back: keep the previous topic away from it
            let end = fresh.len() - 1;
            if end > 0 && fresh.last() == deck.last.as_ref() {
                fresh.swap(0, end);
            }
            deck.remaining = fresh;
        }

        let topic = deck.remaining.pop()?;
        deck.last = Some(topic.clone());
        Some(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::themes::DurationBounds;
    use std::collections::HashSet;

    fn locale(topics: &[&str]) -> LocaleConfig {
        LocaleConfig {
            theme: "curiosidades".to_string(),
            language: "es".to_string(),
            channel_name: "Datos".to_string(),
            description: "Datos".to_string(),
            tags: vec![],
            content_types: vec!["TOP_5".to_string()],
            topics: topics.iter().map(|t| t.to_string()).collect(),
            duration_bounds: DurationBounds::default(),
        }
    }

    #[test]
    fn test_full_pool_before_repeat() {
        let sampler = TopicSampler::seeded(7);
        let locale = locale(&["a", "b", "c", "d", "e"]);

        let drawn: HashSet<String> = (0..5).filter_map(|_| sampler.next(&locale)).collect();
        assert_eq!(drawn.len(), 5);
    }

    #[test]
    fn test_no_immediate_repeat_across_refills() {
        let locale = locale(&["a", "b"]);
        for seed in 0..20 {
            let sampler = TopicSampler::seeded(seed);
            let mut previous: Option<String> = None;
            for _ in 0..10 {
                let topic = sampler.next(&locale).unwrap();
                assert_ne!(previous.as_ref(), Some(&topic));
                previous = Some(topic);
            }
        }
    }

    #[test]
    fn test_single_topic_pool_repeats() {
        let sampler = TopicSampler::seeded(1);
        let locale = locale(&["solo"]);
        assert_eq!(sampler.next(&locale).as_deref(), Some("solo"));
        assert_eq!(sampler.next(&locale).as_deref(), Some("solo"));
    }

    #[test]
    fn test_empty_pool() {
        let sampler = TopicSampler::seeded(1);
        assert!(sampler.next(&locale(&[])).is_none());
    }
}
