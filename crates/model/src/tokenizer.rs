//! Simple word-based tokenizer for benchmark and test prompts.
//! Production deployments would use a BPE tokenizer instead.

use std::collections::HashMap;

pub const BOS_TOKEN_ID: u32 = 0;
pub const PAD_TOKEN_ID: u32 = 1;
pub const EOS_TOKEN_ID: u32 = 2;
pub const UNK_TOKEN_ID: u32 = 3;

pub struct WordTokenizer {
    vocab: HashMap<String, u32>,
    reverse_vocab: HashMap<u32, String>,
}

impl WordTokenizer {
    pub fn new(vocab_size: usize) -> Self {
        let mut vocab = HashMap::new();
        let mut reverse_vocab = HashMap::new();

        for (id, token) in [
            (BOS_TOKEN_ID, "<s>"),
            (PAD_TOKEN_ID, "<pad>"),
            (EOS_TOKEN_ID, "</s>"),
            (UNK_TOKEN_ID, "<unk>"),
        ] {
            vocab.insert(token.to_string(), id);
            reverse_vocab.insert(id, token.to_string());
        }

        let common_words = [
            "the", "a", "is", "in", "to", "of", "and", "for", "on", "with", "as", "at", "by",
            "from", "it", "this", "that", "are", "was", "be", "have", "has", "had", "not", "can",
            "will", "would", "could", "should", "said", "there", "their", "they", "we", "you",
            "he", "she", "i", "my", "your", "our", "but", "or", "so", "if", "then", "when",
            "where", "what", "how", "why", "who", "which", "do", "does", "did", "go", "come",
            "see", "get", "make", "know", "think", "take", "want", "use", "find", "give", "tell",
            "work", "call", "try", "ask", "need", "computer", "science", "study", "computation",
            "information", "university", "california", "berkeley", "public", "research",
            "american", "scientist", "specializing", "systems", "world", "time", "people",
            "state", "new", "one", "two", "first", "school", "city", "founded", "located",
        ];

        for (i, word) in common_words.iter().enumerate() {
            let token_id = i as u32 + 4;
            if token_id as usize >= vocab_size {
                break;
            }
            vocab.insert(word.to_string(), token_id);
            reverse_vocab.insert(token_id, word.to_string());
        }

        Self {
            vocab,
            reverse_vocab,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn encode(&self, text: &str) -> Vec<u32> {
        text.split_whitespace()
            .map(|word| {
                let cleaned = word
                    .trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase();
                *self.vocab.get(&cleaned).unwrap_or(&UNK_TOKEN_ID)
            })
            .collect()
    }

    /// Decode ids back to text, skipping the reserved special tokens.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter(|&&id| id > UNK_TOKEN_ID)
            .filter_map(|id| self.reverse_vocab.get(id))
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }
}
