//! Plain prefix tries used by the protocol handler
//!
//! - `NameTrie`: process-wide set of reserved user names
//! - `BadWordTrie`: masks bad words inside chat lines

use std::collections::HashMap;
use std::io::BufRead;

use parking_lot::Mutex;

/// Character used to mask bad words
pub const MASK: char = '*';

#[derive(Debug, Default)]
struct NameNode {
    next: HashMap<char, NameNode>,
    word: bool,
}

impl NameNode {
    fn find(&self, word: &str) -> Option<&NameNode> {
        word.chars().try_fold(self, |node, c| node.next.get(&c))
    }

    fn insert(&mut self, word: &str) {
        let node = word
            .chars()
            .fold(self, |node, c| node.next.entry(c).or_default());
        node.word = true;
    }
}

/// Exact-match name set, safe to share between handlers
#[derive(Debug, Default)]
pub struct NameTrie {
    root: Mutex<NameNode>,
}

impl NameTrie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str) {
        self.root.lock().insert(name);
    }

    /// Whether `name` was added before
    pub fn full_match(&self, name: &str) -> bool {
        self.root
            .lock()
            .find(name)
            .is_some_and(|node| node.word)
    }

    /// Add `name` unless it is already taken. Returns true if reserved.
    pub fn reserve(&self, name: &str) -> bool {
        let mut root = self.root.lock();
        if root.find(name).is_some_and(|node| node.word) {
            return false;
        }
        root.insert(name);
        true
    }
}

#[derive(Debug, Default)]
struct WordNode {
    next: HashMap<char, WordNode>,
    word: bool,
}

/// Bad word dictionary. Built once at startup, read-only afterwards.
#[derive(Debug, Default)]
pub struct BadWordTrie {
    root: WordNode,
}

impl BadWordTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load one word per line, skipping blank lines
    pub fn from_reader<R: BufRead>(reader: R) -> std::io::Result<Self> {
        let mut trie = Self::new();
        for line in reader.lines() {
            let line = line?;
            let word = line.trim();
            if !word.is_empty() {
                trie.add(word);
            }
        }
        Ok(trie)
    }

    pub fn add(&mut self, word: &str) {
        let node = word
            .chars()
            .fold(&mut self.root, |node, c| node.next.entry(c).or_default());
        node.word = true;
    }

    /// Length in chars of the longest bad word starting at `chars[0]`
    fn longest_match(&self, chars: &[char]) -> Option<usize> {
        let mut node = &self.root;
        let mut found = None;
        for (i, c) in chars.iter().enumerate() {
            match node.next.get(c) {
                Some(next) => node = next,
                None => break,
            }
            if node.word {
                found = Some(i + 1);
            }
        }
        found
    }

    /// Whether `text` contains any bad word
    pub fn contains(&self, text: &str) -> bool {
        let chars: Vec<char> = text.chars().collect();
        (0..chars.len()).any(|i| self.longest_match(&chars[i..]).is_some())
    }

    /// Replace every bad word in `text` with [`MASK`] characters
    pub fn replace(&self, text: &str) -> String {
        if self.root.next.is_empty() {
            return text.to_string();
        }

        let mut chars: Vec<char> = text.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            match self.longest_match(&chars[i..]) {
                Some(len) => {
                    chars[i..i + len].fill(MASK);
                    i += len;
                }
                None => i += 1,
            }
        }
        chars.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_full_match() {
        let names = NameTrie::new();
        names.add("alice");

        assert!(names.full_match("alice"));
        assert!(!names.full_match("ali"));
        assert!(!names.full_match("alice2"));
        assert!(!names.full_match("bob"));
    }

    #[test]
    fn test_name_reserve_once() {
        let names = NameTrie::new();
        assert!(names.reserve("小明"));
        assert!(!names.reserve("小明"));
        assert!(names.reserve("小"));
        assert!(names.full_match("小"));
    }

    #[test]
    fn test_bad_word_replace() {
        let mut words = BadWordTrie::new();
        words.add("bad");
        words.add("worse");

        assert_eq!(words.replace("not bad, worse!"), "not ***, *****!");
        assert_eq!(words.replace("clean"), "clean");
    }

    #[test]
    fn test_bad_word_longest_match_and_unicode() {
        let mut words = BadWordTrie::new();
        words.add("ab");
        words.add("abc");
        words.add("坏");

        assert_eq!(words.replace("xabcx"), "x***x");
        assert_eq!(words.replace("好坏"), "好*");
        assert!(words.contains("zab"));
        assert!(!words.contains("a b"));
    }

    #[test]
    fn test_bad_word_from_reader() {
        let input = "foo\n\n  bar \n";
        let words = BadWordTrie::from_reader(input.as_bytes()).unwrap();
        assert_eq!(words.replace("foo bar baz"), "*** *** baz");
    }

    #[test]
    fn test_empty_dictionary() {
        let words = BadWordTrie::new();
        assert_eq!(words.replace("anything"), "anything");
    }
}
