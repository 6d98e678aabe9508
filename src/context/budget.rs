//! Context budget tracking with high/low watermarks.
//!
//! Pure in-memory: the engine feeds in `prompt_eval_count`/`eval_count`
//! after each model turn, and the manager answers whether compaction is
//! needed and how many tokens it should free. Compaction events are kept
//! in a bounded ring for diagnostics.

use std::collections::VecDeque;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default context window size.
pub const DEFAULT_NUM_CTX: u32 = 8_192;

/// Ratio of the window at which compaction starts.
pub const DEFAULT_HIGH_WATERMARK: f64 = 0.80;

/// Target ratio after compaction.
pub const DEFAULT_LOW_WATERMARK: f64 = 0.60;

/// Tokens reserved for model output.
pub const DEFAULT_RESERVE_OUTPUT: u32 = 2_048;

/// Default number of transcript turns to keep.
pub const DEFAULT_MAX_TRANSCRIPT_TURNS: usize = 5;

/// Maximum retained compaction events.
const MAX_EVENTS: usize = 100;

/// Budget configuration. Invalid values are clamped to defaults at
/// construction, so a live manager always satisfies
/// `0 < low_watermark < high_watermark <= num_ctx`.
#[derive(Debug, Clone, Copy)]
pub struct BudgetConfig {
    pub num_ctx: u32,
    pub high_watermark_ratio: f64,
    pub low_watermark_ratio: f64,
    pub reserve_output_tokens: u32,
    pub max_transcript_turns: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            num_ctx: DEFAULT_NUM_CTX,
            high_watermark_ratio: DEFAULT_HIGH_WATERMARK,
            low_watermark_ratio: DEFAULT_LOW_WATERMARK,
            reserve_output_tokens: DEFAULT_RESERVE_OUTPUT,
            max_transcript_turns: DEFAULT_MAX_TRANSCRIPT_TURNS,
        }
    }
}

impl BudgetConfig {
    fn clamped(mut self) -> Self {
        if self.num_ctx == 0 {
            self.num_ctx = DEFAULT_NUM_CTX;
        }
        if self.high_watermark_ratio <= 0.0 || self.high_watermark_ratio > 1.0 {
            self.high_watermark_ratio = DEFAULT_HIGH_WATERMARK;
        }
        if self.low_watermark_ratio <= 0.0 || self.low_watermark_ratio >= self.high_watermark_ratio
        {
            self.low_watermark_ratio = DEFAULT_LOW_WATERMARK;
        }
        if self.reserve_output_tokens == 0 {
            self.reserve_output_tokens = DEFAULT_RESERVE_OUTPUT;
        }
        if self.max_transcript_turns == 0 {
            self.max_transcript_turns = DEFAULT_MAX_TRANSCRIPT_TURNS;
        }
        self
    }
}

/// A snapshot of the current budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetState {
    pub num_ctx: u32,
    /// Absolute prompt-token count at which compaction starts.
    pub high_watermark: u32,
    /// Absolute prompt-token count compaction targets.
    pub low_watermark: u32,
    /// Tokens available for output.
    pub available_tokens: i64,
    pub last_prompt_tokens: u32,
    pub last_eval_tokens: u32,
    pub usage_ratio: f64,
    pub needs_compaction: bool,
}

/// A record of one compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionEvent {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub tokens_before: u32,
    pub tokens_after: u32,
    pub compacted_items: String,
}

#[derive(Debug, Default)]
struct Metrics {
    last_prompt_tokens: u32,
    last_eval_tokens: u32,
}

/// Tracks token usage against the context window.
#[derive(Debug)]
pub struct BudgetManager {
    config: RwLock<BudgetConfig>,
    metrics: RwLock<Metrics>,
    events: RwLock<VecDeque<CompactionEvent>>,
}

impl BudgetManager {
    /// Create a manager, clamping invalid config values to defaults.
    #[must_use]
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config: RwLock::new(config.clamped()),
            metrics: RwLock::new(Metrics::default()),
            events: RwLock::new(VecDeque::with_capacity(MAX_EVENTS)),
        }
    }

    /// Update the context window size.
    pub fn set_num_ctx(&self, num_ctx: u32) {
        if num_ctx > 0 {
            self.config.write().expect("budget lock").num_ctx = num_ctx;
        }
    }

    /// Current context window size.
    #[must_use]
    pub fn num_ctx(&self) -> u32 {
        self.config.read().expect("budget lock").num_ctx
    }

    /// A copy of the configuration.
    #[must_use]
    pub fn config(&self) -> BudgetConfig {
        *self.config.read().expect("budget lock")
    }

    /// Maximum transcript turns to keep.
    #[must_use]
    pub fn max_transcript_turns(&self) -> usize {
        self.config.read().expect("budget lock").max_transcript_turns
    }

    /// Set the maximum transcript turns.
    pub fn set_max_transcript_turns(&self, turns: usize) {
        if turns > 0 {
            self.config.write().expect("budget lock").max_transcript_turns = turns;
        }
    }

    /// Store the latest token metrics.
    pub fn update_metrics(&self, prompt_tokens: u32, eval_tokens: u32) {
        let mut metrics = self.metrics.write().expect("budget lock");
        metrics.last_prompt_tokens = prompt_tokens;
        metrics.last_eval_tokens = eval_tokens;
    }

    /// The current budget state with derived watermarks.
    #[must_use]
    pub fn state(&self) -> BudgetState {
        let config = *self.config.read().expect("budget lock");
        let metrics = self.metrics.read().expect("budget lock");

        let high_watermark = (f64::from(config.num_ctx) * config.high_watermark_ratio) as u32;
        let low_watermark = (f64::from(config.num_ctx) * config.low_watermark_ratio) as u32;
        let available_tokens = i64::from(config.num_ctx)
            - i64::from(metrics.last_prompt_tokens)
            - i64::from(config.reserve_output_tokens);

        BudgetState {
            num_ctx: config.num_ctx,
            high_watermark,
            low_watermark,
            available_tokens,
            last_prompt_tokens: metrics.last_prompt_tokens,
            last_eval_tokens: metrics.last_eval_tokens,
            usage_ratio: f64::from(metrics.last_prompt_tokens) / f64::from(config.num_ctx),
            needs_compaction: metrics.last_prompt_tokens >= high_watermark,
        }
    }

    /// Whether the context has crossed the high watermark.
    #[must_use]
    pub fn needs_compaction(&self) -> bool {
        self.state().needs_compaction
    }

    /// Target prompt-token count after compaction.
    #[must_use]
    pub fn target_tokens(&self) -> u32 {
        self.state().low_watermark
    }

    /// Tokens that must be freed to reach the low watermark.
    #[must_use]
    pub fn tokens_to_free(&self) -> u32 {
        let state = self.state();
        state.last_prompt_tokens.saturating_sub(state.low_watermark)
    }

    /// Append a compaction event to the bounded ring.
    pub fn record_compaction(
        &self,
        reason: &str,
        tokens_before: u32,
        tokens_after: u32,
        compacted_items: &str,
    ) {
        let mut events = self.events.write().expect("budget lock");
        if events.len() == MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(CompactionEvent {
            timestamp: Utc::now(),
            reason: reason.to_string(),
            tokens_before,
            tokens_after,
            compacted_items: compacted_items.to_string(),
        });
    }

    /// All retained compaction events, oldest first.
    #[must_use]
    pub fn compaction_events(&self) -> Vec<CompactionEvent> {
        self.events.read().expect("budget lock").iter().cloned().collect()
    }

    /// The most recent compaction event, if any.
    #[must_use]
    pub fn last_compaction_event(&self) -> Option<CompactionEvent> {
        self.events.read().expect("budget lock").back().cloned()
    }
}

impl Default for BudgetManager {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let manager = BudgetManager::default();
        let state = manager.state();
        assert_eq!(state.num_ctx, 8_192);
        assert_eq!(state.high_watermark, 6_553);
        assert_eq!(state.low_watermark, 4_915);
        assert!(!state.needs_compaction);
    }

    #[test]
    fn test_invalid_config_clamped() {
        let manager = BudgetManager::new(BudgetConfig {
            num_ctx: 0,
            high_watermark_ratio: 1.5,
            low_watermark_ratio: 0.9,
            reserve_output_tokens: 0,
            max_transcript_turns: 0,
        });
        let config = manager.config();
        assert_eq!(config.num_ctx, DEFAULT_NUM_CTX);
        assert_eq!(config.high_watermark_ratio, DEFAULT_HIGH_WATERMARK);
        assert_eq!(config.low_watermark_ratio, DEFAULT_LOW_WATERMARK);
        assert_eq!(config.reserve_output_tokens, DEFAULT_RESERVE_OUTPUT);
        assert_eq!(config.max_transcript_turns, DEFAULT_MAX_TRANSCRIPT_TURNS);
    }

    #[test]
    fn test_watermark_invariant() {
        let manager = BudgetManager::new(BudgetConfig {
            num_ctx: 10_000,
            ..BudgetConfig::default()
        });
        let state = manager.state();
        assert!(0 < state.low_watermark);
        assert!(state.low_watermark < state.high_watermark);
        assert!(state.high_watermark <= state.num_ctx);
    }

    #[test]
    fn test_watermark_trigger() {
        let manager = BudgetManager::new(BudgetConfig {
            num_ctx: 10_000,
            high_watermark_ratio: 0.8,
            low_watermark_ratio: 0.6,
            ..BudgetConfig::default()
        });

        manager.update_metrics(8_000, 100);
        assert!(manager.needs_compaction());
        assert_eq!(manager.tokens_to_free(), 2_000);

        manager.update_metrics(7_000, 100);
        assert!(!manager.needs_compaction());
        assert_eq!(manager.tokens_to_free(), 1_000);

        manager.update_metrics(5_000, 100);
        assert_eq!(manager.tokens_to_free(), 0);
    }

    #[test]
    fn test_needs_compaction_iff_at_high_watermark() {
        let manager = BudgetManager::new(BudgetConfig {
            num_ctx: 10_000,
            ..BudgetConfig::default()
        });

        manager.update_metrics(7_999, 0);
        assert!(!manager.needs_compaction());
        manager.update_metrics(8_000, 0);
        assert!(manager.needs_compaction());
    }

    #[test]
    fn test_state_usage_ratio_and_available() {
        let manager = BudgetManager::new(BudgetConfig {
            num_ctx: 10_000,
            ..BudgetConfig::default()
        });
        manager.update_metrics(4_000, 500);

        let state = manager.state();
        assert!((state.usage_ratio - 0.4).abs() < 1e-9);
        assert_eq!(state.available_tokens, 10_000 - 4_000 - 2_048);
        assert_eq!(state.last_eval_tokens, 500);
    }

    #[test]
    fn test_available_can_go_negative() {
        let manager = BudgetManager::new(BudgetConfig {
            num_ctx: 4_096,
            ..BudgetConfig::default()
        });
        manager.update_metrics(4_000, 0);
        assert!(manager.state().available_tokens < 0);
    }

    #[test]
    fn test_compaction_event_ring_bounded() {
        let manager = BudgetManager::default();
        for i in 0..150 {
            manager.record_compaction(&format!("reason {i}"), 1_000, 500, "items");
        }

        let events = manager.compaction_events();
        assert_eq!(events.len(), 100);
        assert_eq!(events.first().unwrap().reason, "reason 50");
        assert_eq!(events.last().unwrap().reason, "reason 149");
        assert_eq!(manager.last_compaction_event().unwrap().reason, "reason 149");
    }

    #[test]
    fn test_set_num_ctx_ignores_zero() {
        let manager = BudgetManager::default();
        manager.set_num_ctx(0);
        assert_eq!(manager.num_ctx(), DEFAULT_NUM_CTX);
        manager.set_num_ctx(131_072);
        assert_eq!(manager.num_ctx(), 131_072);
    }

    #[test]
    fn test_set_max_transcript_turns() {
        let manager = BudgetManager::default();
        manager.set_max_transcript_turns(0);
        assert_eq!(manager.max_transcript_turns(), DEFAULT_MAX_TRANSCRIPT_TURNS);
        manager.set_max_transcript_turns(12);
        assert_eq!(manager.max_transcript_turns(), 12);
    }
}
