use serde_json::json;

pub static ENTITY_EXTRACTION_SYSTEM_MESSAGE: &str = r#"You annotate United States government documents (bills, public laws, the Federal Register, agency reports).

List every named entity that appears verbatim in the user's text. Use exactly one of these types:
- PERSON: an individual, e.g. "Senator Jane Smith"
- ORG: an agency, committee, company or other organization
- GPE: a country, state, city or other geopolitical area
- DATE: a calendar date or a specific year
- MONEY: an amount of money
- LAW: a statute, public law or code citation, e.g. "Pub. L. 117-58", "42 U.S.C. 1983"
- BILL: a bill or resolution number, e.g. "H.R. 3684", "S. Res. 12"

Copy the entity text exactly as it appears so it can be located in the document. Give a confidence between 0 and 1. Do not invent entities that are not in the text."#;

pub fn get_entity_extraction_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "text": { "type": "string" },
                        "entity_type": {
                            "type": "string",
                            "enum": ["PERSON", "ORG", "GPE", "DATE", "MONEY", "LAW", "BILL"]
                        },
                        "confidence": { "type": "number" }
                    },
                    "required": ["text", "entity_type", "confidence"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["entities"],
        "additionalProperties": false
    })
}
