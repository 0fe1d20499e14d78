//! Advisory token and cost accounting.
//!
//! Token counts are estimated (~4 characters per token) and prices come from a
//! static table, so the numbers are a rough guide, not a bill.

use crate::llm::UsageSnapshot;

/// Pricing and context window of a known model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub id: &'static str,
    pub context_window: u64,
    /// Cost per million input tokens (USD)
    pub input_cost_per_m: f64,
    /// Cost per million output tokens (USD)
    pub output_cost_per_m: f64,
}

const PRICING: &[ModelPricing] = &[
    ModelPricing {
        id: "gpt-3.5-turbo",
        context_window: 16_385,
        input_cost_per_m: 0.50,
        output_cost_per_m: 1.50,
    },
    ModelPricing {
        id: "gpt-4",
        context_window: 8_192,
        input_cost_per_m: 30.0,
        output_cost_per_m: 60.0,
    },
    ModelPricing {
        id: "gpt-4o",
        context_window: 128_000,
        input_cost_per_m: 2.50,
        output_cost_per_m: 10.0,
    },
    ModelPricing {
        id: "gpt-4o-mini",
        context_window: 128_000,
        input_cost_per_m: 0.15,
        output_cost_per_m: 0.60,
    },
    ModelPricing {
        id: "claude-3-haiku-20240307",
        context_window: 200_000,
        input_cost_per_m: 0.25,
        output_cost_per_m: 1.25,
    },
    ModelPricing {
        id: "claude-3-5-sonnet-20241022",
        context_window: 200_000,
        input_cost_per_m: 3.0,
        output_cost_per_m: 15.0,
    },
    ModelPricing {
        id: "llama-3.3-70b-versatile",
        context_window: 128_000,
        input_cost_per_m: 0.59,
        output_cost_per_m: 0.79,
    },
];

pub fn pricing_for(model: &str) -> Option<&'static ModelPricing> {
    PRICING.iter().find(|p| p.id == model)
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Running per-session counters. Each turn adds its own delta.
#[derive(Debug, Clone)]
pub struct UsageTracker {
    model: String,
    input_tokens: u64,
    output_tokens: u64,
    estimated_cost: f64,
    context_tokens: u64,
}

impl UsageTracker {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            estimated_cost: 0.0,
            context_tokens: 0,
        }
    }

    /// Record one request/response pair.
    ///
    /// `input` is the estimated size of everything sent with the request and
    /// `output` the estimated size of the reply.
    pub fn track(&mut self, input: u64, output: u64) {
        self.input_tokens += input;
        self.output_tokens += output;
        self.estimated_cost += self.price(input, output);
        self.context_tokens = input + output;
    }

    /// Price of one request. Each side is clamped to half the context window.
    pub fn price(&self, input: u64, output: u64) -> f64 {
        let Some(pricing) = pricing_for(&self.model) else {
            return 0.0;
        };
        let half = pricing.context_window / 2;
        let input = input.min(half) as f64;
        let output = output.min(half) as f64;
        (input / 1_000_000.0) * pricing.input_cost_per_m
            + (output / 1_000_000.0) * pricing.output_cost_per_m
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            estimated_cost: self.estimated_cost,
            context_tokens: self.context_tokens,
            context_limit: pricing_for(&self.model).map(|p| p.context_window),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.model));
    }
}
