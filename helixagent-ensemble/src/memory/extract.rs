//! Best-effort entity and relation extraction.
//!
//! The real knowledge-extraction engine is an external collaborator; this
//! heuristic pass keeps the graph populated when none is wired in.
//! Entities are capitalized token runs; relations come from a small set of
//! copula and verb patterns.

const RELATION_VERBS: [&str; 6] = ["is", "are", "was", "uses", "contains", "supports"];

const STOPWORDS: [&str; 12] = [
    "the", "a", "an", "and", "or", "but", "if", "then", "what", "how", "why", "when",
];

/// Capitalized token runs, deduplicated, sentence leads excluded when they
/// are stopwords.
pub fn extract_entities(text: &str) -> Vec<String> {
    let mut entities: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for token in text.split_whitespace() {
        let cleaned = token.trim_matches(|c: char| !c.is_alphanumeric());
        let is_capitalized = cleaned
            .chars()
            .next()
            .is_some_and(|c| c.is_uppercase());
        let is_stopword = STOPWORDS.contains(&cleaned.to_lowercase().as_str());

        if is_capitalized && !is_stopword && !cleaned.is_empty() {
            current.push(cleaned);
        } else if !current.is_empty() {
            push_unique(&mut entities, current.join(" "));
            current.clear();
        }
    }
    if !current.is_empty() {
        push_unique(&mut entities, current.join(" "));
    }

    entities
}

/// (subject, predicate, object) triples from "X <verb> Y" sentences.
pub fn extract_relations(text: &str) -> Vec<(String, String, String)> {
    let mut relations = Vec::new();

    for sentence in text.split(['.', '!', '?', '\n']) {
        let words: Vec<&str> = sentence.split_whitespace().collect();
        for (i, word) in words.iter().enumerate() {
            let lower = word.to_lowercase();
            if !RELATION_VERBS.contains(&lower.as_str()) {
                continue;
            }
            if i == 0 || i + 1 >= words.len() {
                continue;
            }
            let subject = words[..i].join(" ");
            let object = words[i + 1..].join(" ");
            let subject = subject.trim_matches(|c: char| !c.is_alphanumeric() && c != ' ');
            let object = object.trim_matches(|c: char| !c.is_alphanumeric() && c != ' ');
            if subject.is_empty() || object.is_empty() {
                continue;
            }
            relations.push((subject.to_string(), lower, object.to_string()));
            break; // one triple per sentence
        }
    }

    relations
}

fn push_unique(entities: &mut Vec<String>, candidate: String) {
    if !entities.iter().any(|e| e.eq_ignore_ascii_case(&candidate)) {
        entities.push(candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capitalized_runs_become_entities() {
        let entities = extract_entities("Paris is the capital of France.");
        assert_eq!(entities, vec!["Paris".to_string(), "France".to_string()]);
    }

    #[test]
    fn multi_word_entities_stay_together() {
        let entities = extract_entities("The Eiffel Tower is in Paris.");
        assert!(entities.contains(&"Eiffel Tower".to_string()));
        assert!(entities.contains(&"Paris".to_string()));
    }

    #[test]
    fn leading_stopwords_are_not_entities() {
        let entities = extract_entities("What is the weather today?");
        assert!(entities.is_empty());
    }

    #[test]
    fn copula_sentences_yield_triples() {
        let relations = extract_relations("Paris is the capital of France.");
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].0, "Paris");
        assert_eq!(relations[0].1, "is");
        assert!(relations[0].2.contains("capital"));
    }

    #[test]
    fn one_triple_per_sentence() {
        let relations = extract_relations("Rust uses ownership. Cargo is the build tool.");
        assert_eq!(relations.len(), 2);
    }

    #[test]
    fn duplicate_entities_collapse() {
        let entities = extract_entities("Rust and Rust and RUST");
        assert_eq!(entities.len(), 1);
    }
}
