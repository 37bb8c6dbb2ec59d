use std::sync::OnceLock;

use common::storage::types::extracted_document::{Entity, EntityType};
use regex::Regex;
use tracing::warn;

pub const PATTERN_SOURCE: &str = "pattern";

const STATES: &[&str] = &[
    "Alabama", "Alaska", "Arizona", "Arkansas", "California", "Colorado", "Connecticut",
    "Delaware", "Florida", "Georgia", "Hawaii", "Idaho", "Illinois", "Indiana", "Iowa",
    "Kansas", "Kentucky", "Louisiana", "Maine", "Maryland", "Massachusetts", "Michigan",
    "Minnesota", "Mississippi", "Missouri", "Montana", "Nebraska", "Nevada", "New Hampshire",
    "New Jersey", "New Mexico", "New York", "North Carolina", "North Dakota", "Ohio",
    "Oklahoma", "Oregon", "Pennsylvania", "Rhode Island", "South Carolina", "South Dakota",
    "Tennessee", "Texas", "Utah", "Vermont", "Virginia", "Washington", "West Virginia",
    "Wisconsin", "Wyoming",
];

const OTHER_PLACES: &[&str] = &[
    "United States", "District of Columbia", "Puerto Rico", "Guam", "American Samoa",
    "Virgin Islands", "Canada", "Mexico", "China", "Russia", "Ukraine", "Israel", "Japan",
    "India", "United Kingdom", "European Union",
];

struct Rule {
    entity_type: EntityType,
    regex: Regex,
    confidence: f32,
}

/// Fast regex tagger tuned for federal documents: citations, bill numbers,
/// dates, amounts, agencies, titled people and a gazetteer of places.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternTagger;

impl PatternTagger {
    pub fn tag(&self, text: &str) -> Vec<Entity> {
        let mut found = Vec::new();

        for rule in rules() {
            for captures in rule.regex.captures_iter(text) {
                let Some(m) = captures.get(1).or_else(|| captures.get(0)) else {
                    continue;
                };
                let matched = m.as_str().trim_end_matches([',', ';', ':']);
                if matched.is_empty() {
                    continue;
                }
                found.push(Entity {
                    text: matched.to_string(),
                    entity_type: rule.entity_type,
                    span: m.start()..m.start() + matched.len(),
                    confidence: rule.confidence,
                    source: PATTERN_SOURCE.to_string(),
                });
            }
        }

        drop_contained(found)
    }
}

/// Keeps the longest match where one match sits entirely inside another.
fn drop_contained(mut found: Vec<Entity>) -> Vec<Entity> {
    found.sort_by(|a, b| {
        a.span
            .start
            .cmp(&b.span.start)
            .then_with(|| b.span.len().cmp(&a.span.len()))
            .then_with(|| b.confidence.total_cmp(&a.confidence))
    });

    let mut kept: Vec<Entity> = Vec::with_capacity(found.len());
    for entity in found {
        let inside = kept.iter().any(|outer| {
            outer.span.start <= entity.span.start && entity.span.end <= outer.span.end
        });
        if !inside {
            kept.push(entity);
        }
    }
    kept
}

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let places = STATES
            .iter()
            .chain(OTHER_PLACES)
            .map(|place| regex::escape(place))
            .collect::<Vec<_>>()
            .join("|");

        let specs: Vec<(EntityType, String, f32)> = vec![
            (
                EntityType::Bill,
                r"\b(?:H\.\s?J\.\s?Res\.|S\.\s?J\.\s?Res\.|H\.\s?Con\.\s?Res\.|S\.\s?Con\.\s?Res\.|H\.\s?Res\.|S\.\s?Res\.|H\.\s?R\.|S\.)\s?\d{1,5}\b".into(),
                0.95,
            ),
            (
                EntityType::Law,
                r"\bPub(?:lic)?\.?\s+L(?:aw)?\.?\s+(?:No\.\s+)?\d{2,3}[-–]\d{1,4}\b".into(),
                0.95,
            ),
            (
                EntityType::Law,
                r"\b\d{1,2}\s+U\.\s?S\.\s?C\.\s+(?:§+\s*)?\d+[a-z]?(?:\([A-Za-z0-9]+\))*".into(),
                0.95,
            ),
            (
                EntityType::Law,
                r"\b\d{1,2}\s+C\.?F\.?R\.?\s+(?:[Pp]art\s+)?\d+(?:\.\d+)?".into(),
                0.9,
            ),
            (
                EntityType::Law,
                r"\b(?:[Tt]he\s+)?((?:[A-Z][a-z]+\s+(?:(?:and|of|for|on|the)\s+)?){2,8}Act(?:\s+of\s+\d{4})?)\b".into(),
                0.75,
            ),
            (
                EntityType::Date,
                r"\b(?:January|February|March|April|May|June|July|August|September|October|November|December)\s+\d{1,2},\s+\d{4}\b".into(),
                0.9,
            ),
            (EntityType::Date, r"\b\d{4}-\d{2}-\d{2}\b".into(), 0.85),
            (EntityType::Date, r"\b[Ff]iscal\s+[Yy]ear\s+\d{4}\b".into(), 0.8),
            (
                EntityType::Money,
                r"\$\s?\d{1,3}(?:,\d{3})*(?:\.\d+)?(?:\s+(?:thousand|million|billion|trillion))?".into(),
                0.9,
            ),
            (
                EntityType::Org,
                r"\b(?:Department|Office|Bureau|Agency|Administration|Commission|Committee|Board|Council|Institute)\s+(?:of|on|for)\s+(?:the\s+)?[A-Z][A-Za-z]+(?:\s+(?:and\s+)?[A-Z][A-Za-z]+)*".into(),
                0.85,
            ),
            (
                EntityType::Org,
                r"\b(?:EPA|FDA|GAO|CBO|IRS|FEMA|NASA|SEC|FTC|FCC|OMB|USDA|HUD|DOJ|DOE|DOT|HHS)\b".into(),
                0.8,
            ),
            (
                EntityType::Org,
                r"\b(?:Congress|Senate|House of Representatives|Supreme Court)\b".into(),
                0.8,
            ),
            (
                EntityType::Org,
                r"\b(?:[A-Z][A-Za-z&]+\s+){1,5}(?:Inc\.|Corp\.|Corporation|LLC|Company|Association|Foundation|University)".into(),
                0.7,
            ),
            (
                EntityType::Person,
                r"\b(?:Mr|Mrs|Ms|Dr|Sen|Rep|Gov|Hon|Senator|Representative|President|Secretary|Judge|Justice)\.?\s+[A-Z][a-z]+(?:\s+[A-Z]\.)?(?:\s+[A-Z][a-z]+)?".into(),
                0.8,
            ),
            (EntityType::Gpe, format!(r"\b(?:{places})\b"), 0.85),
        ];

        specs
            .into_iter()
            .filter_map(|(entity_type, pattern, confidence)| match Regex::new(&pattern) {
                Ok(regex) => Some(Rule {
                    entity_type,
                    regex,
                    confidence,
                }),
                Err(err) => {
                    warn!(%entity_type, error = %err, "skipping invalid entity pattern");
                    None
                }
            })
            .collect()
    })
}
