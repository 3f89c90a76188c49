//! Reassembles one round's stream deltas into text and tool calls

use crate::llm::{ToolCallDelta, ToolCallRequest};
use std::collections::HashSet;

/// Upper bound on tool-call slots per round. Fragments beyond it are ignored.
const MAX_TOOL_SLOTS: usize = 128;

/// What a finished round produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Accumulates deltas for a single round.
///
/// Tool-call fragments are routed by slot index. Slots may be filled in any
/// order and skipped indices stay empty until dropped at `finish`.
#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    text: String,
    slots: Vec<ToolCallRequest>,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&mut self, fragment: &str) {
        self.text.push_str(fragment);
    }

    /// Route a tool-call fragment to its slot.
    ///
    /// A non-empty `id` replaces the slot's id; `name` and `arguments`
    /// fragments are appended.
    pub fn push_tool_call(&mut self, delta: ToolCallDelta) {
        if delta.index >= MAX_TOOL_SLOTS {
            tracing::warn!(index = delta.index, "Ignoring tool call fragment beyond slot limit");
            return;
        }
        if delta.index >= self.slots.len() {
            self.slots.resize_with(delta.index + 1, ToolCallRequest::default);
        }

        let slot = &mut self.slots[delta.index];
        if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
            slot.id = id;
        }
        if let Some(name) = delta.name {
            slot.name.push_str(&name);
        }
        if let Some(arguments) = delta.arguments {
            slot.arguments.push_str(&arguments);
        }
    }

    /// Text accumulated so far
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Close the round. Slots that never received a name are dropped and
    /// slots without an id get one derived from their index, never reusing
    /// an id already present in the round.
    pub fn finish(self) -> RoundOutput {
        let mut taken: HashSet<String> = self
            .slots
            .iter()
            .filter(|slot| !slot.name.is_empty() && !slot.id.is_empty())
            .map(|slot| slot.id.clone())
            .collect();

        let tool_calls = self
            .slots
            .into_iter()
            .enumerate()
            .filter(|(_, slot)| !slot.name.is_empty())
            .map(|(index, mut slot)| {
                if slot.id.is_empty() {
                    slot.id = unused_id(index, &taken);
                    taken.insert(slot.id.clone());
                }
                slot
            })
            .collect();
        RoundOutput {
            text: self.text,
            tool_calls,
        }
    }
}

/// `call_{index}`, suffixed until it collides with nothing in `taken`
fn unused_id(index: usize, taken: &HashSet<String>) -> String {
    let base = format!("call_{index}");
    if !taken.contains(&base) {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{base}_{n}");
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fragment(index: usize, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> ToolCallDelta {
        ToolCallDelta {
            index,
            id: id.map(String::from),
            name: name.map(String::from),
            arguments: args.map(String::from),
        }
    }

    #[test]
    fn test_plain_text_round() {
        let mut acc = DeltaAccumulator::new();
        acc.push_text("You have ");
        acc.push_text("2 pods");
        assert_eq!(acc.text(), "You have 2 pods");

        let out = acc.finish();
        assert_eq!(out.text, "You have 2 pods");
        assert!(out.tool_calls.is_empty());
    }

    #[test]
    fn test_arguments_are_concatenated() {
        let mut acc = DeltaAccumulator::new();
        acc.push_tool_call(fragment(0, Some("call_1"), Some("list_resources"), Some("")));
        acc.push_tool_call(fragment(0, None, None, Some("{\"kind\":")));
        acc.push_tool_call(fragment(0, None, None, Some("\"pods\"}")));

        let out = acc.finish();
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].id, "call_1");
        assert_eq!(out.tool_calls[0].name, "list_resources");
        assert_eq!(out.tool_calls[0].arguments, "{\"kind\":\"pods\"}");
    }

    #[test]
    fn test_gap_slots_are_dropped() {
        let mut acc = DeltaAccumulator::new();
        // Provider skipped index 0 and 1 entirely
        acc.push_tool_call(fragment(2, Some("c"), Some("think"), Some("{}")));

        let out = acc.finish();
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].id, "c");
    }

    #[test]
    fn test_out_of_order_slots_keep_index_order() {
        let mut acc = DeltaAccumulator::new();
        acc.push_tool_call(fragment(1, Some("b"), Some("second"), None));
        acc.push_tool_call(fragment(0, Some("a"), Some("first"), None));

        let names: Vec<_> = acc.finish().tool_calls.into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_nameless_slot_is_dropped() {
        let mut acc = DeltaAccumulator::new();
        acc.push_tool_call(fragment(0, Some("a"), None, Some("{}")));
        acc.push_tool_call(fragment(1, Some("b"), Some("think"), Some("{}")));

        let out = acc.finish();
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].id, "b");
    }

    #[test]
    fn test_empty_id_does_not_clear() {
        let mut acc = DeltaAccumulator::new();
        acc.push_tool_call(fragment(0, Some("call_1"), Some("think"), None));
        acc.push_tool_call(fragment(0, Some(""), None, Some("{}")));
        assert_eq!(acc.finish().tool_calls[0].id, "call_1");
    }

    #[test]
    fn test_missing_id_is_synthesized() {
        let mut acc = DeltaAccumulator::new();
        acc.push_tool_call(fragment(1, None, Some("think"), Some("{}")));
        assert_eq!(acc.finish().tool_calls[0].id, "call_1");
    }

    #[test]
    fn test_synthesized_id_never_duplicates_provider_id() {
        let mut acc = DeltaAccumulator::new();
        acc.push_tool_call(fragment(0, Some("call_1"), Some("list_resources"), Some("{}")));
        acc.push_tool_call(fragment(1, None, Some("think"), Some("{}")));
        acc.push_tool_call(fragment(2, Some("call_1_1"), Some("get_resource"), Some("{}")));

        let ids: Vec<_> = acc.finish().tool_calls.into_iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], "call_1");
        assert_ne!(ids[1], ids[0]);
        assert_ne!(ids[1], ids[2]);
        assert_eq!(ids[1], "call_1_2");
    }

    #[test]
    fn test_huge_index_is_ignored() {
        let mut acc = DeltaAccumulator::new();
        acc.push_tool_call(fragment(usize::MAX, Some("x"), Some("think"), None));
        assert!(acc.finish().tool_calls.is_empty());
    }

    /// Split a string into chunks at the given char boundaries
    fn split_at_points(s: &str, cuts: &[usize]) -> Vec<String> {
        let chars: Vec<char> = s.chars().collect();
        let mut points: Vec<usize> = cuts.iter().map(|c| c % (chars.len() + 1)).collect();
        points.push(0);
        points.push(chars.len());
        points.sort_unstable();
        points.dedup();
        points
            .windows(2)
            .map(|w| chars[w[0]..w[1]].iter().collect())
            .collect()
    }

    fn call_strategy() -> impl Strategy<Value = (String, String, String)> {
        (
            "call_[a-z0-9]{1,8}",
            "[a-z_]{1,12}",
            prop::collection::vec("[a-z0-9\":{}, ]{0,6}", 0..5).prop_map(|parts| parts.concat()),
        )
    }

    proptest! {
        #[test]
        fn prop_scrambled_fragments_reconstruct_calls(
            calls in prop::collection::vec(call_strategy(), 1..5),
            cuts in prop::collection::vec(prop::collection::vec(0usize..64, 0..4), 5),
            order_seed in prop::collection::vec(0usize..1000, 0..64),
        ) {
            // Per-slot fragment queues, each in order
            let mut queues: Vec<Vec<ToolCallDelta>> = calls
                .iter()
                .enumerate()
                .map(|(index, (id, name, args))| {
                    let mut frags = vec![fragment(index, Some(id), Some(name), None)];
                    for piece in split_at_points(args, &cuts[index]) {
                        frags.push(fragment(index, None, None, Some(&piece)));
                    }
                    frags.reverse();
                    frags
                })
                .collect();

            // Interleave slots in a scrambled order, keeping each slot's own order
            let mut scrambled = Vec::new();
            let mut seeds = order_seed.into_iter();
            while queues.iter().any(|q| !q.is_empty()) {
                let live: Vec<usize> = (0..queues.len()).filter(|i| !queues[*i].is_empty()).collect();
                let pick = live[seeds.next().unwrap_or(0) % live.len()];
                if let Some(frag) = queues[pick].pop() {
                    scrambled.push(frag);
                }
            }

            let mut acc = DeltaAccumulator::new();
            for frag in scrambled {
                acc.push_tool_call(frag);
            }
            let out = acc.finish();

            let expected: Vec<ToolCallRequest> = calls
                .iter()
                .map(|(id, name, args)| ToolCallRequest {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: args.clone(),
                })
                .collect();
            prop_assert_eq!(out.tool_calls, expected);
        }
    }
}
