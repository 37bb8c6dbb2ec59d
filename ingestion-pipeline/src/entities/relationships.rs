use std::{collections::HashMap, ops::Range};

use common::storage::types::extracted_document::{Entity, EntityType, Relationship};

/// Maximum gap, in bytes, between two entities that co-occur.
pub const RELATIONSHIP_WINDOW: usize = 150;

/// Type pair to relation. Pairs are unordered when matching; the relation's
/// `entity1` is always the first type listed here.
const RULES: &[(EntityType, EntityType, &str)] = &[
    (EntityType::Person, EntityType::Org, "affiliated_with"),
    (EntityType::Org, EntityType::Gpe, "located_in"),
    (EntityType::Person, EntityType::Gpe, "associated_with"),
    (EntityType::Law, EntityType::Org, "administered_by"),
    (EntityType::Bill, EntityType::Person, "sponsored_by"),
    (EntityType::Bill, EntityType::Law, "amends"),
    (EntityType::Money, EntityType::Org, "funding"),
    (EntityType::Date, EntityType::Law, "enacted_on"),
    (EntityType::Org, EntityType::Org, "partner_of"),
];

const ABBREVIATIONS: &[&str] = &[
    "mr.", "mrs.", "ms.", "dr.", "sen.", "rep.", "gov.", "hon.", "pub.", "no.", "jr.", "sr.",
    "st.", "inc.", "corp.", "co.", "res.", "con.", "stat.", "sec.", "v.", "vs.", "etc.", "pt.",
];

/// Entities in the same sentence and within `window` bytes of each other
/// become a typed relationship when their type pair has a rule. Duplicates
/// by `(entity1, entity2, relation_type)` keep the shortest distance.
pub fn find_relationships(entities: &[Entity], text: &str, window: usize) -> Vec<Relationship> {
    let sentences = sentence_spans(text);

    let mut ordered: Vec<&Entity> = entities.iter().collect();
    ordered.sort_by_key(|e| e.span.start);

    let mut by_sentence: HashMap<usize, Vec<&Entity>> = HashMap::new();
    for entity in ordered {
        by_sentence
            .entry(sentence_of(&sentences, entity.span.start))
            .or_default()
            .push(entity);
    }

    let mut sentence_ids: Vec<usize> = by_sentence.keys().copied().collect();
    sentence_ids.sort_unstable();

    let mut found: Vec<Relationship> = Vec::new();
    let mut seen: HashMap<(String, String, &'static str), usize> = HashMap::new();

    for id in sentence_ids {
        let Some(members) = by_sentence.get(&id) else {
            continue;
        };
        for (i, first) in members.iter().enumerate() {
            for second in members.iter().skip(i + 1) {
                let distance = second.span.start.saturating_sub(first.span.end);
                if distance > window {
                    break;
                }
                if first.normalized_text() == second.normalized_text() {
                    continue;
                }
                let Some((a, b, relation)) = relation_for(first, second) else {
                    continue;
                };

                let key = (a.text.clone(), b.text.clone(), relation);
                match seen.get(&key) {
                    Some(&idx) => {
                        if let Some(existing) = found.get_mut(idx) {
                            existing.distance = existing.distance.min(distance);
                        }
                    }
                    None => {
                        seen.insert(key, found.len());
                        found.push(Relationship {
                            entity1: a.text.clone(),
                            entity2: b.text.clone(),
                            relation_type: relation.to_string(),
                            distance,
                        });
                    }
                }
            }
        }
    }

    found
}

fn relation_for<'a>(
    first: &'a Entity,
    second: &'a Entity,
) -> Option<(&'a Entity, &'a Entity, &'static str)> {
    RULES.iter().find_map(|(left, right, relation)| {
        if first.entity_type == *left && second.entity_type == *right {
            Some((first, second, *relation))
        } else if first.entity_type == *right && second.entity_type == *left {
            Some((second, first, *relation))
        } else {
            None
        }
    })
}

fn sentence_of(sentences: &[Range<usize>], offset: usize) -> usize {
    sentences
        .iter()
        .position(|s| offset < s.end)
        .unwrap_or_else(|| sentences.len().saturating_sub(1))
}

/// Byte ranges of sentences. A sentence ends at a blank line, or at `.`, `!`
/// or `?` followed by whitespace and a capital letter, unless the word before
/// the period is an abbreviation such as `Sen.` or `U.S.C.`.
fn sentence_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        let end = idx + ch.len_utf8();
        let boundary = match ch {
            '\n' => chars.peek().is_some_and(|(_, next)| *next == '\n'),
            '.' | '!' | '?' => {
                let rest = text.get(end..).unwrap_or("");
                let next_visible = rest.trim_start().chars().next();
                rest.starts_with(char::is_whitespace)
                    && next_visible.is_some_and(|c| c.is_uppercase() || c == '"')
                    && !(ch == '.' && is_abbreviation(text.get(start..end).unwrap_or("")))
            }
            _ => false,
        };

        if boundary {
            spans.push(start..end);
            start = end;
        }
    }

    if start < text.len() || spans.is_empty() {
        spans.push(start..text.len());
    }
    spans
}

fn is_abbreviation(sentence_so_far: &str) -> bool {
    let word = sentence_so_far
        .rsplit(char::is_whitespace)
        .next()
        .unwrap_or("")
        .trim_start_matches(['(', '"']);
    let inner_dot = word.trim_end_matches('.').contains('.');
    let single_letter = word.chars().count() <= 2;

    inner_dot || single_letter || ABBREVIATIONS.contains(&word.to_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::PatternTagger;

    fn entity(text: &str, doc: &str, entity_type: EntityType) -> Entity {
        let start = doc.find(text).expect("entity text in doc");
        Entity {
            text: text.to_string(),
            entity_type,
            span: start..start + text.len(),
            confidence: 0.9,
            source: "test".into(),
        }
    }

    #[test]
    fn abbreviations_do_not_split_sentences() {
        let doc = "Sen. Smith introduced H.R. 3684 under 23 U.S.C. 101. It passed.";
        let spans = sentence_spans(doc);
        assert_eq!(spans.len(), 2);
        assert_eq!(&doc[spans[1].clone()], " It passed.");
    }

    #[test]
    fn co_occurring_entities_get_typed_relationship() {
        let doc = "Senator Jane Smith joined the Department of Energy. Ohio was not mentioned with her.";
        let entities = vec![
            entity("Department of Energy", doc, EntityType::Org),
            entity("Senator Jane Smith", doc, EntityType::Person),
            entity("Ohio", doc, EntityType::Gpe),
        ];

        let relationships = find_relationships(&entities, doc, RELATIONSHIP_WINDOW);
        assert_eq!(
            relationships,
            vec![Relationship {
                entity1: "Senator Jane Smith".into(),
                entity2: "Department of Energy".into(),
                relation_type: "affiliated_with".into(),
                distance: " joined the ".len(),
            }]
        );
    }

    #[test]
    fn window_limits_pairs() {
        let filler = "x".repeat(200);
        let doc = format!("Senator Jane Smith {filler} Department of Energy");
        let entities = vec![
            entity("Senator Jane Smith", &doc, EntityType::Person),
            entity("Department of Energy", &doc, EntityType::Org),
        ];

        assert!(find_relationships(&entities, &doc, RELATIONSHIP_WINDOW).is_empty());
        assert_eq!(find_relationships(&entities, &doc, 500).len(), 1);
    }

    #[test]
    fn repeated_pairs_are_deduplicated() {
        let doc = "H.R. 3684 amends Pub. L. 117-58 in section 2 of the bill text, and H.R. 3684 again amends Pub. L. 117-58 here.";
        let entities = PatternTagger.tag(doc);

        let relationships = find_relationships(&entities, doc, RELATIONSHIP_WINDOW);
        let amends: Vec<_> = relationships
            .iter()
            .filter(|r| r.relation_type == "amends")
            .collect();
        assert_eq!(amends.len(), 1);
        assert_eq!(amends[0].entity1, "H.R. 3684");
        assert_eq!(amends[0].entity2, "Pub. L. 117-58");
        assert_eq!(amends[0].distance, " amends ".len());
    }
}
