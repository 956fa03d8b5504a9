//! Greedy splitter that packs ordered items into character-bounded
//! chunks. Pure: no side effects, output fully determined by inputs.

use redraft_core::{Chunk, SourceItem};

/// Format an item for inclusion in chunk text. `original_index` is the
/// position in the unfiltered source, so displayed numbers reflect gaps
/// left by blank items.
pub type ItemFormatter<'a> = &'a dyn Fn(&SourceItem, usize) -> String;

/// Item filter; items it rejects are left out of every chunk.
pub type ItemFilter<'a> = &'a dyn Fn(&SourceItem) -> bool;

/// Split `items` into chunks whose formatted text stays within `budget`
/// characters. Items are appended greedily in order; when the next item
/// would overflow a non-empty chunk, the chunk is closed and a new one
/// started. An item whose formatted text alone exceeds the budget gets a
/// chunk of its own rather than being split or dropped. The trailing
/// partial chunk is always flushed.
#[must_use]
pub fn split(
    items: &[SourceItem],
    budget: usize,
    format: ItemFormatter<'_>,
    include: Option<ItemFilter<'_>>,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut text = String::new();
    let mut ids: Vec<String> = Vec::new();

    for item in items {
        let keep = match include {
            Some(filter) => filter(item),
            None => !item.is_blank(),
        };
        if !keep {
            continue;
        }
        let formatted = format(item, item.original_index);
        if !text.is_empty() && text.chars().count() + formatted.chars().count() > budget {
            chunks.push(Chunk {
                text: std::mem::take(&mut text),
                item_ids: std::mem::take(&mut ids),
            });
        }
        text.push_str(&formatted);
        ids.push(item.id.clone());
        // An oversized single item closes immediately so it cannot drag
        // followers past the budget with it.
        if ids.len() == 1 && text.chars().count() > budget {
            chunks.push(Chunk {
                text: std::mem::take(&mut text),
                item_ids: std::mem::take(&mut ids),
            });
        }
    }

    if !ids.is_empty() {
        chunks.push(Chunk {
            text,
            item_ids: ids,
        });
    }
    chunks
}

/// Default formatter: the 1-based original position, a separator, the
/// text, then a blank line.
#[must_use]
pub fn numbered_format(item: &SourceItem, original_index: usize) -> String {
    format!("[{}] {}\n\n", original_index + 1, item.text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, text: &str, idx: usize) -> SourceItem {
        SourceItem::new(id, text, idx)
    }

    fn plain(items: &[SourceItem], budget: usize) -> Vec<Chunk> {
        split(items, budget, &|i, _| format!("{}\n", i.text), None)
    }

    #[test]
    fn packs_greedily_within_budget() {
        let items = vec![
            item("a", "aaaa", 0),
            item("b", "bbbb", 1),
            item("c", "cccc", 2),
        ];
        // each formats to 5 chars; budget fits two
        let chunks = plain(&items, 10);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].item_ids, vec!["a", "b"]);
        assert_eq!(chunks[1].item_ids, vec!["c"]);
    }

    #[test]
    fn ids_partition_the_filtered_input_in_order() {
        let items: Vec<SourceItem> = (0..40)
            .map(|i| item(&format!("p{i}"), &"x".repeat(i % 7 + 1), i))
            .collect();
        let chunks = plain(&items, 16);
        let mut seen: Vec<String> = Vec::new();
        for chunk in &chunks {
            seen.extend(chunk.item_ids.iter().cloned());
        }
        let expected: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn oversized_item_gets_its_own_chunk() {
        let items = vec![
            item("a", "aa", 0),
            item("big", &"z".repeat(50), 1),
            item("b", "bb", 2),
        ];
        let chunks = plain(&items, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].item_ids, vec!["big"]);
        assert!(chunks[1].text.chars().count() > 10);
        assert_eq!(chunks[2].item_ids, vec!["b"]);
    }

    #[test]
    fn every_chunk_respects_budget_except_single_oversized() {
        let items: Vec<SourceItem> = (0..30)
            .map(|i| item(&format!("p{i}"), &"y".repeat((i * 13) % 40 + 1), i))
            .collect();
        for chunk in plain(&items, 25) {
            if chunk.item_ids.len() > 1 {
                assert!(chunk.text.chars().count() <= 25, "{:?}", chunk.item_ids);
            }
        }
    }

    #[test]
    fn blank_items_are_skipped_but_keep_their_index() {
        let items = vec![
            item("a", "hello", 0),
            item("gap", "   ", 1),
            item("b", "world", 2),
        ];
        let chunks = split(&items, 100, &numbered_format, None);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].item_ids, vec!["a", "b"]);
        // the blank item's position still shows as a gap: [1] then [3]
        assert!(chunks[0].text.contains("[1] hello"));
        assert!(chunks[0].text.contains("[3] world"));
    }

    #[test]
    fn custom_filter_overrides_blank_default() {
        let items = vec![item("a", "keep", 0), item("b", "drop", 1)];
        let keep_a: ItemFilter<'_> = &|i: &SourceItem| i.id == "a";
        let chunks = split(&items, 100, &|i, _| i.text.clone(), Some(keep_a));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].item_ids, vec!["a"]);
    }

    #[test]
    fn empty_and_all_blank_inputs_yield_no_chunks() {
        assert!(plain(&[], 10).is_empty());
        let blanks = vec![item("a", "", 0), item("b", "  ", 1)];
        assert!(plain(&blanks, 10).is_empty());
    }

    #[test]
    fn last_partial_chunk_is_flushed() {
        let items = vec![item("a", "aaaa", 0), item("b", "bb", 1)];
        let chunks = plain(&items, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].item_ids, vec!["a", "b"]);
    }

    use proptest::prelude::*;

    fn items_strategy() -> impl Strategy<Value = Vec<SourceItem>> {
        // texts include blank and whitespace-only entries so the default
        // filter is exercised too
        prop::collection::vec("[ a-z]{0,40}", 0..24).prop_map(|texts| {
            texts
                .into_iter()
                .enumerate()
                .map(|(i, text)| SourceItem::new(format!("p{i}"), text, i))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn chunk_ids_partition_the_nonblank_input_in_order(
            items in items_strategy(),
            budget in 1usize..60,
        ) {
            let chunks = plain(&items, budget);
            let seen: Vec<String> = chunks
                .iter()
                .flat_map(|c| c.item_ids.iter().cloned())
                .collect();
            let expected: Vec<String> = items
                .iter()
                .filter(|i| !i.is_blank())
                .map(|i| i.id.clone())
                .collect();
            prop_assert_eq!(seen, expected);
        }

        #[test]
        fn only_single_item_chunks_may_exceed_the_budget(
            items in items_strategy(),
            budget in 1usize..60,
        ) {
            for chunk in plain(&items, budget) {
                prop_assert!(!chunk.item_ids.is_empty());
                if chunk.item_ids.len() > 1 {
                    prop_assert!(chunk.text.chars().count() <= budget);
                }
            }
        }
    }
}
