//! Incremental, character-by-character dictionary search

use super::StringId;
use super::volume::{Edge, TreeNode, Volume};
use smallvec::SmallVec;

/// Position in a volume's trie after a sequence of typed characters
///
/// Each [`Cursor::advance`] consumes one character. Once a STRING edge is reached the cursor is
/// complete: only one string can still match, and further characters are checked against its
/// remaining text.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    volume: &'a Volume,
    /// Current tree row
    node: TreeNode,
    /// String reached through a STRING edge
    completed: Option<StringId>,
    /// Lowercase characters consumed so far
    prefix: Vec<u8>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(volume: &'a Volume, root: TreeNode) -> Self {
        Self {
            volume,
            node: root,
            completed: None,
            prefix: Vec::new(),
        }
    }

    /// Consume one character (ASCII case ignored)
    ///
    /// Returns `false`, leaving the cursor unchanged, when no string continues with it.
    /// Character `0` accepts the current prefix as a complete word.
    pub fn advance(&mut self, character: u8) -> bool {
        let character = character.to_ascii_lowercase();

        if let Some(id) = self.completed {
            let text = self.volume.get(id).unwrap_or_default().as_bytes();
            if character == 0 {
                return self.prefix.len() == text.len();
            }
            return match text.get(self.prefix.len()) {
                Some(b) if b.to_ascii_lowercase() == character => {
                    self.prefix.push(character);
                    true
                }
                _ => false,
            };
        }

        let Some(edge) = self.volume.edge(self.node, character) else {
            return false;
        };
        if edge.is_tree() {
            let Some(next) = self.row(edge.index) else {
                return false;
            };
            self.node = next;
            self.prefix.push(character);
        } else {
            self.completed = Some(edge.index);
            if character != 0 {
                self.prefix.push(character);
            }
        }
        true
    }

    /// Whether a single string is left
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.completed.is_some()
    }

    /// Whether the characters typed so far form a whole word
    pub fn completable(&self) -> bool {
        match self.completed {
            Some(id) => self
                .volume
                .get(id)
                .is_some_and(|text| text.len() == self.prefix.len()),
            None => self.volume.edge(self.node, 0).is_some(),
        }
    }

    /// The matching string once the cursor is complete
    #[inline]
    pub fn result(&self) -> Option<StringId> {
        self.completed
    }

    /// Lowercase characters consumed so far
    #[inline]
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Suggested text for the typed prefix
    ///
    /// Follows the trie while the continuation is unambiguous. If a single string is left it
    /// is returned whole; otherwise the result is the longest prefix shared by every
    /// remaining string, in the stored case.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn completion(&self) -> Option<&'a str> {
        if let Some(id) = self.completed {
            return self.volume.get(id);
        }

        let mut node = self.node;
        loop {
            let mut edges = self.volume.edges(node);
            let first = edges.next()?;
            let unique = edges.next().is_none();

            if unique && first.is_tree() {
                node = self.row(first.index)?;
                continue;
            }

            let text = self.volume.get(self.first_string(first)?)?;
            if unique {
                return Some(text);
            }
            return Some(truncate(text, node.position as usize));
        }
    }

    /// Characters that extend the prefix to at least one string
    pub fn next_choices(&self) -> SmallVec<[u8; 16]> {
        if let Some(id) = self.completed {
            return self
                .volume
                .get(id)
                .and_then(|text| text.as_bytes().get(self.prefix.len()))
                .map(u8::to_ascii_lowercase)
                .into_iter()
                .collect();
        }

        self.volume
            .edges(self.node)
            .map(|edge| edge.character)
            .filter(|&character| character != 0)
            .collect()
    }

    /// Up to `limit` strings matching the prefix, in trie order
    pub fn matches(&self, limit: usize) -> Vec<StringId> {
        let mut found = Vec::new();
        if limit == 0 {
            return found;
        }
        match self.completed {
            Some(id) => found.push(id),
            None => self.collect(self.node, limit, &mut found),
        }
        found
    }

    fn collect(&self, node: TreeNode, limit: usize, found: &mut Vec<StringId>) {
        for edge in self.volume.edges(node) {
            if found.len() >= limit {
                return;
            }
            if edge.is_tree() {
                if let Some(child) = self.row(edge.index) {
                    self.collect(child, limit, found);
                }
            } else {
                found.push(edge.index);
            }
        }
    }

    /// First string reachable through `edge`, following first edges down
    fn first_string(&self, mut edge: Edge) -> Option<StringId> {
        while edge.is_tree() {
            let node = self.row(edge.index)?;
            edge = self.volume.edges(node).next()?;
        }
        Some(edge.index)
    }

    #[inline]
    fn row(&self, index: u32) -> Option<TreeNode> {
        self.volume.trie()?.tree.get(index as usize)
    }
}

/// Cut `text` to at most `len` bytes, backing off to a character boundary
fn truncate(text: &str, len: usize) -> &str {
    let mut end = len.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::{Dictionary, DictionaryHandler};
    use crate::fixture::sample_map;
    use crate::model::Handler;
    use crate::section::SectionStore;

    fn dictionary() -> Dictionary {
        let store = SectionStore::from_bytes(sample_map().build()).unwrap();
        DictionaryHandler
            .map(&store, store.find("string").unwrap())
            .unwrap()
    }

    fn type_text<'a>(volume: &'a Volume, text: &str) -> Cursor<'a> {
        let mut cursor = volume.cursor().unwrap();
        for character in text.bytes() {
            assert!(cursor.advance(character), "cannot type {text}");
        }
        cursor
    }

    #[test]
    fn test_elm_is_completable() {
        let dictionary = dictionary();
        let streets = dictionary.volume("street").unwrap();
        let cursor = type_text(streets, "elm");

        assert!(!cursor.is_complete());
        assert!(cursor.completable());
        assert_eq!(cursor.result(), None);
        assert_eq!(cursor.next_choices().as_slice(), b"w");
    }

    #[test]
    fn test_elm_end_marker_selects_word() {
        let dictionary = dictionary();
        let streets = dictionary.volume("street").unwrap();
        let mut cursor = type_text(streets, "elm");

        assert!(cursor.advance(0));
        assert!(cursor.is_complete());
        assert_eq!(cursor.result(), Some(3));
        assert!(!cursor.advance(b'w'));
    }

    #[test]
    fn test_oak_complete_after_third_character() {
        let dictionary = dictionary();
        let streets = dictionary.volume("street").unwrap();
        let cursor = type_text(streets, "oak");

        assert!(cursor.is_complete());
        assert!(cursor.completable());
        assert_eq!(cursor.result(), Some(5));
        assert!(cursor.next_choices().is_empty());
        assert_eq!(cursor.prefix(), b"oak");
    }

    #[test]
    fn test_complete_cursor_checks_remaining_text() {
        let dictionary = dictionary();
        let streets = dictionary.volume("street").unwrap();
        let mut cursor = type_text(streets, "o");

        assert!(cursor.is_complete());
        assert!(!cursor.completable());
        assert_eq!(cursor.next_choices().as_slice(), b"a");
        assert!(!cursor.advance(b'x'));
        assert!(!cursor.advance(0));
        assert!(cursor.advance(b'A'));
        assert_eq!(cursor.prefix(), b"oa");
    }

    #[test]
    fn test_dead_keys() {
        let dictionary = dictionary();
        let streets = dictionary.volume("street").unwrap();
        let mut cursor = streets.cursor().unwrap();

        assert_eq!(cursor.next_choices().as_slice(), b"emo");
        assert!(!cursor.advance(b'z'));
        assert!(cursor.prefix().is_empty());
        assert!(!cursor.completable());
    }

    #[test]
    fn test_completion() {
        let dictionary = dictionary();
        let streets = dictionary.volume("street").unwrap();

        // "m" is followed by "a" only, then the names split
        assert_eq!(type_text(streets, "m").completion(), Some("Ma"));
        assert_eq!(type_text(streets, "map").completion(), Some("Maple"));
        assert_eq!(type_text(streets, "o").completion(), Some("Oak"));
        assert_eq!(type_text(streets, "e").completion(), Some("Elm"));
        assert_eq!(streets.cursor().unwrap().completion(), Some(""));
    }

    #[test]
    fn test_matches() {
        let dictionary = dictionary();
        let streets = dictionary.volume("street").unwrap();

        assert_eq!(type_text(streets, "e").matches(10), vec![3, 4]);
        assert_eq!(type_text(streets, "ma").matches(10), vec![1, 2]);
        assert_eq!(streets.cursor().unwrap().matches(3), vec![3, 4, 1]);
        assert!(type_text(streets, "oak").matches(0).is_empty());
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate("Élan", 1), "");
        assert_eq!(truncate("Élan", 2), "É");
        assert_eq!(truncate("Élan", 10), "Élan");
    }
}
