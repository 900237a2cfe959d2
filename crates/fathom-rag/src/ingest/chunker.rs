//! Deterministic marker-based chunking.
//!
//! Works in characters, not bytes: the corpus is mixed CJK/ASCII and every
//! size constant counts characters. For each chunk the splitter aims at
//! `target` chars, then looks for a split marker in a ±200-char window,
//! trying markers in priority order — forward first (so long as the chunk
//! stays under `max`), backward second (so long as it stays over `min`),
//! hard cut at the target otherwise. Consecutive chunks overlap by
//! `overlap` chars.

const SPLIT_MARKERS: [&str; 12] = [
    "\n\n\n", "\n\n", "。\n", "！\n", "？\n", "；\n", "。", "！", "？", "；", "：", "\n",
];

const SEARCH_WINDOW: usize = 200;

pub struct ChunkSplitter {
    target: usize,
    min: usize,
    max: usize,
    overlap: usize,
}

impl ChunkSplitter {
    pub fn new(target: usize, min: usize, max: usize, overlap: usize) -> Self {
        Self {
            target,
            min,
            max,
            overlap,
        }
    }

    pub fn split(&self, content: &str) -> Vec<String> {
        let chars: Vec<char> = content.chars().collect();
        let total = chars.len();
        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < total {
            // Remainder too small to split further.
            if total - start <= self.min {
                push_trimmed(&chars[start..], &mut chunks);
                break;
            }

            let target_end = start + self.target;
            if target_end >= total {
                push_trimmed(&chars[start..], &mut chunks);
                break;
            }

            let search_start = (start + self.min).max(target_end.saturating_sub(SEARCH_WINDOW));
            let search_end = (target_end + SEARCH_WINDOW).min(total);

            let mut split_end = target_end;
            for marker in SPLIT_MARKERS {
                let marker: Vec<char> = marker.chars().collect();
                if let Some(end) = find_first(&chars, &marker, target_end, search_end) {
                    if end - start <= self.max {
                        split_end = end;
                        break;
                    }
                }
                if let Some(end) = find_last(&chars, &marker, search_start, target_end) {
                    if end - start >= self.min {
                        split_end = end;
                        break;
                    }
                }
            }

            push_trimmed(&chars[start..split_end], &mut chunks);

            let mut next = split_end
                .saturating_sub(self.overlap)
                .max(start + self.min);
            if next <= start {
                next = start + self.min;
            }
            start = next;
        }

        chunks
    }
}

impl Default for ChunkSplitter {
    fn default() -> Self {
        Self::new(1024, 800, 1200, 100)
    }
}

fn push_trimmed(chars: &[char], chunks: &mut Vec<String>) {
    let text: String = chars.iter().collect();
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

/// First occurrence of `marker` whose match starts in `[from, to)` and fits
/// within `to`. Returns the index one past the marker.
fn find_first(chars: &[char], marker: &[char], from: usize, to: usize) -> Option<usize> {
    if marker.is_empty() || to < marker.len() {
        return None;
    }
    let last_start = to - marker.len();
    for i in from..=last_start {
        if chars[i..i + marker.len()] == *marker {
            return Some(i + marker.len());
        }
    }
    None
}

/// Last occurrence of `marker` lying entirely within `[from, to)`. Returns
/// the index one past the marker.
fn find_last(chars: &[char], marker: &[char], from: usize, to: usize) -> Option<usize> {
    if marker.is_empty() || to < marker.len() || from + marker.len() > to {
        return None;
    }
    let last_start = to - marker.len();
    for i in (from..=last_start).rev() {
        if chars[i..i + marker.len()] == *marker {
            return Some(i + marker.len());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter() -> ChunkSplitter {
        ChunkSplitter::default()
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = splitter().split("短文本。");
        assert_eq!(chunks, vec!["短文本。"]);
    }

    #[test]
    fn whitespace_only_yields_nothing() {
        assert!(splitter().split("   \n\n  ").is_empty());
    }

    #[test]
    fn chunking_is_deterministic() {
        let paragraph = "句子内容。".repeat(120);
        let text = format!("{paragraph}\n\n{paragraph}\n\n{paragraph}");
        let first = splitter().split(&text);
        let second = splitter().split(&text);
        assert_eq!(first, second);
        assert!(first.len() >= 2);
    }

    #[test]
    fn chunks_respect_max_size() {
        let text = "字".repeat(5000); // no markers at all — hard cuts
        let chunks = splitter().split(&text);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 1200, "chunk exceeded max size");
        }
    }

    #[test]
    fn prefers_sentence_boundary_near_target() {
        // A sentence ending just after the 1024-char target: the forward
        // marker search should cut there, not mid-sentence.
        let filler = "词".repeat(1050);
        let text = format!("{filler}。\n{}", "尾".repeat(900));
        let chunks = splitter().split(&text);
        assert!(chunks[0].ends_with('。'));
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = "段落句子。".repeat(500);
        let chunks = splitter().split(&text);
        assert!(chunks.len() >= 2);
        // The tail of chunk 1 reappears inside chunk 2.
        let chunk_len = chunks[0].chars().count();
        let tail: String = chunks[0].chars().skip(chunk_len - 40).collect();
        assert!(chunks[1].contains(&tail));
    }

    #[test]
    fn three_ascii_paragraphs_make_two_to_three_bounded_chunks() {
        // ~2200 ASCII chars in three paragraphs separated by blank lines.
        let sentence = "The quick brown fox jumps over the lazy dog again. ";
        let paragraph_one = sentence.repeat(19); // ~988 chars
        let paragraph_two = sentence.repeat(12); // ~624 chars
        let paragraph_three = sentence.repeat(12);
        let text = format!("{paragraph_one}\n\n{paragraph_two}\n\n{paragraph_three}");

        let chunks = splitter().split(&text);
        assert!(
            (2..=3).contains(&chunks.len()),
            "expected 2-3 chunks, got {}",
            chunks.len()
        );
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 1200);
        }
        // Paragraph-two text must be covered by some chunk.
        assert!(chunks.iter().any(|c| c.contains(sentence.trim())));
    }
}
