//! The SSE metering hook (§4.1.1): per-chunk usage extraction with
//! buffering across chunk boundaries.
//!
//! Grounded directly on the teacher's `streaming.rs`
//! `create_native_anthropic_sse_stream`, which buffers partial SSE
//! events in an `Arc<Mutex<String>>` and extracts complete events on
//! `\n\n`. The teacher built that buffering to forward native Anthropic
//! streams byte-for-byte; this module reuses the same buffering
//! discipline purely for metering (the dispatcher forwards bytes to the
//! client as they arrive, unbuffered — see `dispatcher.rs`), since
//! Gemini's cumulative `usageMetadata` needs exactly this tolerance for
//! a `}` split across two reads (§8 scenario 4).

use crate::provider::Platform;
use serde_json::Value;

/// Running usage totals for one request, accumulated across however
/// many SSE chunks the upstream sends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub reasoning_tokens: u64,
}

/// Observes SSE bytes as they stream past and accumulates usage
/// totals. Does not alter or re-emit bytes; the dispatcher forwards
/// the original bytes to the client independently and in the same
/// order, so this can run inline without risking reorder.
pub struct SseMeter {
    platform: Platform,
    buffer: String,
    totals: UsageTotals,
}

impl SseMeter {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            buffer: String::new(),
            totals: UsageTotals::default(),
        }
    }

    /// Feed the next chunk of raw upstream bytes. Safe to call with
    /// chunks that split an SSE event (or even a JSON token) at an
    /// arbitrary byte boundary.
    pub fn observe(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        while let Some(event_end) = find_event_boundary(&self.buffer) {
            let event_text = self.buffer[..event_end.0].to_string();
            self.buffer = self.buffer[event_end.1..].to_string();
            self.observe_event(&event_text);
        }
    }

    fn observe_event(&mut self, event_text: &str) {
        let data: String = event_text
            .lines()
            .filter_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
            .collect::<Vec<_>>()
            .join("\n");

        if data.is_empty() || data == "[DONE]" {
            return;
        }

        let Ok(value) = serde_json::from_str::<Value>(&data) else {
            return;
        };

        match self.platform {
            Platform::Claude | Platform::Custom(_) => self.observe_claude(&value),
            Platform::Codex => self.observe_codex(&value),
            Platform::Gemini => self.observe_gemini(&value),
        }
    }

    fn observe_claude(&mut self, value: &Value) {
        let Some(usage) = value.pointer("/message/usage") else {
            return;
        };
        self.totals.input_tokens += as_u64(usage, "input_tokens");
        self.totals.output_tokens += as_u64(usage, "output_tokens");
        self.totals.cache_creation_input_tokens += as_u64(usage, "cache_creation_input_tokens");
        self.totals.cache_read_input_tokens += as_u64(usage, "cache_read_input_tokens");
    }

    fn observe_codex(&mut self, value: &Value) {
        let Some(usage) = value.pointer("/response/usage") else {
            return;
        };
        self.totals.input_tokens += as_u64(usage, "input_tokens");
        self.totals.output_tokens += as_u64(usage, "output_tokens");
        self.totals.cache_read_input_tokens +=
            as_u64_at(usage, &["input_tokens_details", "cached_tokens"]);
        self.totals.reasoning_tokens +=
            as_u64_at(usage, &["output_tokens_details", "reasoning_tokens"]);
    }

    /// Gemini chunks carry a *cumulative* `usageMetadata`: take the
    /// maximum seen, not the sum (§4.1.1, §8 SSE-metering-idempotence).
    fn observe_gemini(&mut self, value: &Value) {
        let Some(usage) = value.get("usageMetadata") else {
            return;
        };

        let prompt = as_u64(usage, "promptTokenCount");
        let cached = as_u64(usage, "cachedContentTokenCount");
        let thoughts = as_u64(usage, "thoughtsTokenCount");
        let candidates_present = usage.get("candidatesTokenCount").is_some();
        let candidates = as_u64(usage, "candidatesTokenCount");
        let total = as_u64(usage, "totalTokenCount");

        self.totals.input_tokens = self.totals.input_tokens.max(prompt);
        self.totals.cache_read_input_tokens = self.totals.cache_read_input_tokens.max(cached);
        self.totals.reasoning_tokens = self.totals.reasoning_tokens.max(thoughts);

        let output = if candidates_present {
            candidates
        } else {
            total.saturating_sub(prompt)
        };
        self.totals.output_tokens = self.totals.output_tokens.max(output);
    }

    /// Meter whatever is left in the buffer as a final event, for an
    /// upstream that terminates its last SSE event without a trailing
    /// blank-line separator. Idempotent: the buffer is drained, so a
    /// second call is a no-op.
    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let event_text = std::mem::take(&mut self.buffer);
        self.observe_event(&event_text);
    }

    pub fn totals(&self) -> UsageTotals {
        self.totals.clone()
    }
}

fn as_u64(value: &Value, field: &str) -> u64 {
    value.get(field).and_then(Value::as_u64).unwrap_or(0)
}

fn as_u64_at(value: &Value, path: &[&str]) -> u64 {
    let mut cur = value;
    for segment in path {
        match cur.get(segment) {
            Some(next) => cur = next,
            None => return 0,
        }
    }
    cur.as_u64().unwrap_or(0)
}

/// Find the end of the next complete SSE event in `buffer`, returning
/// `(event_text_end, consumed_end)` so the caller can slice the event
/// text and advance past the separator in one step. Accepts both
/// `\n\n` and `\r\n\r\n` separators.
fn find_event_boundary(buffer: &str) -> Option<(usize, usize)> {
    if let Some(pos) = buffer.find("\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    if let Some(pos) = buffer.find("\n\n") {
        return Some((pos, pos + 2));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_sums_usage_across_events() {
        let mut meter = SseMeter::new(Platform::Claude);
        meter.observe(b"data: {\"message\":{\"usage\":{\"input_tokens\":3,\"output_tokens\":1}}}\n\n");
        meter.observe(b"data: {\"message\":{\"usage\":{\"input_tokens\":0,\"output_tokens\":2}}}\n\n");
        let totals = meter.totals();
        assert_eq!(totals.input_tokens, 3);
        assert_eq!(totals.output_tokens, 3);
    }

    #[test]
    fn codex_captures_cached_and_reasoning_tokens() {
        let mut meter = SseMeter::new(Platform::Codex);
        meter.observe(
            b"data: {\"response\":{\"usage\":{\"input_tokens\":10,\"output_tokens\":5,\
              \"input_tokens_details\":{\"cached_tokens\":4},\
              \"output_tokens_details\":{\"reasoning_tokens\":2}}}}\n\n",
        );
        let totals = meter.totals();
        assert_eq!(totals.input_tokens, 10);
        assert_eq!(totals.output_tokens, 5);
        assert_eq!(totals.cache_read_input_tokens, 4);
        assert_eq!(totals.reasoning_tokens, 2);
    }

    #[test]
    fn gemini_takes_the_maximum_not_the_sum() {
        let mut meter = SseMeter::new(Platform::Gemini);
        meter.observe(b"data: {\"usageMetadata\":{\"promptTokenCount\":10,\"candidatesTokenCount\":5}}\n\n");
        meter.observe(b"data: {\"usageMetadata\":{\"promptTokenCount\":10,\"candidatesTokenCount\":20}}\n\n");
        meter.observe(b"data: {\"usageMetadata\":{\"promptTokenCount\":10,\"candidatesTokenCount\":20}}\n\n");
        let totals = meter.totals();
        assert_eq!(totals.input_tokens, 10);
        assert_eq!(totals.output_tokens, 20);
    }

    #[test]
    fn gemini_derives_output_from_total_when_candidates_count_absent() {
        let mut meter = SseMeter::new(Platform::Gemini);
        meter.observe(b"data: {\"usageMetadata\":{\"promptTokenCount\":10,\"totalTokenCount\":30}}\n\n");
        let totals = meter.totals();
        assert_eq!(totals.output_tokens, 20);
    }

    #[test]
    fn handles_an_event_split_across_two_chunks_at_the_closing_brace() {
        let mut meter = SseMeter::new(Platform::Gemini);
        // Simulate a TCP split landing inside the JSON payload.
        meter.observe(b"data: {\"usageMetadata\":{\"promptTokenCount\":10,\"candidatesTokenCount\":20}");
        meter.observe(b"}\n\n");
        let totals = meter.totals();
        assert_eq!(totals.input_tokens, 10);
        assert_eq!(totals.output_tokens, 20);
    }

    #[test]
    fn flush_meters_a_final_event_with_no_trailing_separator() {
        let mut meter = SseMeter::new(Platform::Gemini);
        meter.observe(b"data: {\"usageMetadata\":{\"promptTokenCount\":10,\"candidatesTokenCount\":20}}");
        assert_eq!(meter.totals(), UsageTotals::default());
        meter.flush();
        let totals = meter.totals();
        assert_eq!(totals.input_tokens, 10);
        assert_eq!(totals.output_tokens, 20);
    }

    #[test]
    fn ignores_done_marker_and_non_json_lines() {
        let mut meter = SseMeter::new(Platform::Claude);
        meter.observe(b"data: [DONE]\n\n");
        assert_eq!(meter.totals(), UsageTotals::default());
    }

    #[test]
    fn custom_family_uses_claude_wire_shape() {
        let mut meter = SseMeter::new(Platform::Custom("my-tool".into()));
        meter.observe(b"data: {\"message\":{\"usage\":{\"input_tokens\":7,\"output_tokens\":2}}}\n\n");
        let totals = meter.totals();
        assert_eq!(totals.input_tokens, 7);
        assert_eq!(totals.output_tokens, 2);
    }
}
