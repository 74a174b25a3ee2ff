use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde_json::{Map, Value};

use crate::db::{PolicyMetadata, UNKNOWN_POLICY_ID};
use crate::error::ExtractError;

const UNKNOWN_TEXT: &str = "Unknown";

/// A complete record plus anything that had to be defaulted or coerced badly.
#[derive(Debug, Clone)]
pub struct Normalized {
    pub record: PolicyMetadata,
    pub warnings: Vec<String>,
}

/// Fill every canonical field, coercing types where the reply drifted.
///
/// A missing `effective_date` becomes `today`. One that is present but
/// unreadable becomes `listed` (the index date) when known, else `today`.
pub fn normalize(value: &Value, today: NaiveDate, listed: Option<NaiveDate>) -> Result<Normalized, ExtractError> {
    let Value::Object(obj) = value else {
        return Err(ExtractError::Parse(format!(
            "expected a JSON object, got {}",
            kind(value)
        )));
    };

    let mut warnings = Vec::new();
    let record = PolicyMetadata {
        policy_id: policy_id(obj, &mut warnings),
        specialty: list(obj, "specialty", &mut warnings),
        client_interest_flag: list(obj, "client_interest_flag", &mut warnings),
        policy_type: text(obj, "policy_type", &mut warnings),
        payer: text(obj, "payer", &mut warnings),
        topic_keywords: list(obj, "topic_keywords", &mut warnings),
        update_type: text(obj, "update_type", &mut warnings),
        effective_date: effective_date(obj, today, listed, &mut warnings),
        jurisdiction: list(obj, "jurisdiction", &mut warnings),
        urgency_level: urgency(obj, &mut warnings),
        source_url: obj
            .get("source_url")
            .or_else(|| obj.get("pdf_url"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    };

    Ok(Normalized { record, warnings })
}

fn present<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key).filter(|v| !v.is_null())
}

fn policy_id(obj: &Map<String, Value>, warnings: &mut Vec<String>) -> String {
    let id = match present(obj, "policy_id") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    if id.is_empty() {
        warnings.push("policy_id missing; using sentinel".to_string());
        UNKNOWN_POLICY_ID.to_string()
    } else {
        id
    }
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn list(obj: &Map<String, Value>, key: &str, warnings: &mut Vec<String>) -> Vec<String> {
    match present(obj, key) {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::Array(_) | Value::Object(_) => {
                    warnings.push(format!("{}: nested value flattened to text", key));
                    Some(item.to_string())
                }
                other => scalar_text(other),
            })
            .collect(),
        Some(Value::Object(_)) => {
            warnings.push(format!("{}: object where a list was expected", key));
            Vec::new()
        }
        Some(other) => scalar_text(other).into_iter().collect(),
    }
}

fn text(obj: &Map<String, Value>, key: &str, warnings: &mut Vec<String>) -> String {
    let value = match present(obj, key) {
        None => None,
        Some(Value::Array(items)) => {
            let parts: Vec<String> = items.iter().filter_map(scalar_text).collect();
            Some(parts.join(", ")).filter(|s| !s.is_empty())
        }
        Some(Value::Object(_)) => {
            warnings.push(format!("{}: object where text was expected", key));
            None
        }
        Some(other) => scalar_text(other),
    };
    value.unwrap_or_else(|| UNKNOWN_TEXT.to_string())
}

fn effective_date(
    obj: &Map<String, Value>,
    today: NaiveDate,
    listed: Option<NaiveDate>,
    warnings: &mut Vec<String>,
) -> String {
    let date = match present(obj, "effective_date") {
        None => today,
        Some(v) => match v.as_str().and_then(parse_date) {
            Some(d) => d,
            None => {
                let fallback = listed.unwrap_or(today);
                warnings.push(format!("effective_date {} unreadable; using {}", v, fallback));
                fallback
            }
        },
    };
    date.format("%Y-%m-%d").to_string()
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y", "%B %d, %Y", "%b %d, %Y", "%d %B %Y", "%Y/%m/%d"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Four-digit years only; `%Y` happily reads "24" as year 24.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let plausible = |d: &NaiveDate| d.year() >= 1000;

    DATE_FORMATS
        .iter()
        .filter_map(|f| NaiveDate::parse_from_str(raw, f).ok())
        .find(plausible)
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .filter_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
                .map(|dt| dt.date())
                .find(plausible)
        })
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()).filter(plausible))
}

fn urgency(obj: &Map<String, Value>, warnings: &mut Vec<String>) -> i64 {
    let parsed = match present(obj, "urgency_level") {
        None => return 0,
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.round() as i64))
        }
        Some(_) => None,
    };
    parsed.unwrap_or_else(|| {
        warnings.push("urgency_level not numeric; using 0".to_string());
        0
    })
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 4).unwrap()
    }

    #[test]
    fn empty_object_gets_every_default() {
        let n = normalize(&json!({}), today(), None).unwrap();
        let r = n.record;
        assert_eq!(r.policy_id, "UNKNOWN");
        assert!(r.has_sentinel_id());
        assert!(r.specialty.is_empty());
        assert!(r.client_interest_flag.is_empty());
        assert_eq!(r.policy_type, "Unknown");
        assert_eq!(r.payer, "Unknown");
        assert!(r.topic_keywords.is_empty());
        assert_eq!(r.update_type, "Unknown");
        assert_eq!(r.effective_date, "2025-03-04");
        assert!(r.jurisdiction.is_empty());
        assert_eq!(r.urgency_level, 0);
        assert_eq!(r.source_url, None);
        assert_eq!(n.warnings.len(), 1);
    }

    #[test]
    fn complete_record_unchanged() {
        let record = PolicyMetadata {
            policy_id: "AD-A006".into(),
            specialty: vec!["Obstetrics".into()],
            client_interest_flag: vec!["Commercial".into(), "Medicare".into()],
            policy_type: "Administrative".into(),
            payer: "Cigna".into(),
            topic_keywords: vec!["abortion".into()],
            update_type: "Annual Review".into(),
            effective_date: "2024-01-15".into(),
            jurisdiction: vec!["US".into()],
            urgency_level: 2,
            source_url: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        let n = normalize(&value, today(), None).unwrap();
        assert_eq!(n.record, record);
        assert!(n.warnings.is_empty());

        let again = normalize(&serde_json::to_value(&n.record).unwrap(), today(), None).unwrap();
        assert_eq!(again.record, record);
    }

    #[test]
    fn types_are_coerced() {
        let n = normalize(
            &json!({
                "policy_id": 1234,
                "specialty": "Cardiology",
                "client_interest_flag": ["Commercial", null, " ", 7],
                "policy_type": ["Medical", "Coverage"],
                "payer": true,
                "topic_keywords": null,
                "update_type": "  New  ",
                "effective_date": "07/01/2024",
                "jurisdiction": [],
                "urgency_level": "4"
            }),
            today(),
            None,
        )
        .unwrap();
        let r = n.record;
        assert_eq!(r.policy_id, "1234");
        assert_eq!(r.specialty, vec!["Cardiology"]);
        assert_eq!(r.client_interest_flag, vec!["Commercial", "7"]);
        assert_eq!(r.policy_type, "Medical, Coverage");
        assert_eq!(r.payer, "true");
        assert!(r.topic_keywords.is_empty());
        assert_eq!(r.update_type, "New");
        assert_eq!(r.effective_date, "2024-07-01");
        assert_eq!(r.urgency_level, 4);
        assert!(n.warnings.is_empty());
    }

    #[test]
    fn float_urgency_rounds_and_garbage_warns() {
        let r = normalize(&json!({"policy_id": "A", "urgency_level": 2.6}), today(), None).unwrap();
        assert_eq!(r.record.urgency_level, 3);

        let r = normalize(&json!({"policy_id": "A", "urgency_level": "high"}), today(), None).unwrap();
        assert_eq!(r.record.urgency_level, 0);
        assert_eq!(r.warnings.len(), 1);
    }

    #[test]
    fn unreadable_date_falls_back_to_today() {
        let r = normalize(&json!({"policy_id": "A", "effective_date": "sometime in 2024"}), today(), None).unwrap();
        assert_eq!(r.record.effective_date, "2025-03-04");
        assert_eq!(r.warnings.len(), 1);

        let r = normalize(&json!({"policy_id": "A", "effective_date": "2024-05-06T00:00:00Z"}), today(), None).unwrap();
        assert_eq!(r.record.effective_date, "2024-05-06");
    }

    #[test]
    fn written_out_dates_are_kept() {
        for raw in [
            "January 15, 2024",
            "Jan 15, 2024",
            "15 January 2024",
            "2024-01-15T00:00:00",
            "2024-01-15T08:30:00.250",
            "2024-01-15 08:30:00",
            "01/15/2024",
            "2024/01/15",
        ] {
            let r = normalize(&json!({"policy_id": "A", "effective_date": raw}), today(), None).unwrap();
            assert_eq!(r.record.effective_date, "2024-01-15", "{}", raw);
            assert!(r.warnings.is_empty(), "{}", raw);
        }
    }

    #[test]
    fn two_digit_year_is_not_year_24() {
        let r = normalize(&json!({"policy_id": "A", "effective_date": "01/15/24"}), today(), None).unwrap();
        assert_eq!(r.record.effective_date, "2024-01-15");

        let r = normalize(&json!({"policy_id": "A", "effective_date": "0024-01-15"}), today(), None).unwrap();
        assert_eq!(r.record.effective_date, "2025-03-04");
        assert_eq!(r.warnings.len(), 1);
    }

    #[test]
    fn unreadable_date_prefers_listing_date() {
        let listed = NaiveDate::from_ymd_opt(2024, 2, 10).unwrap();
        let r = normalize(&json!({"policy_id": "A", "effective_date": "TBD"}), today(), Some(listed)).unwrap();
        assert_eq!(r.record.effective_date, "2024-02-10");
        assert_eq!(r.warnings.len(), 1);

        // Absent still means today.
        let r = normalize(&json!({"policy_id": "A"}), today(), Some(listed)).unwrap();
        assert_eq!(r.record.effective_date, "2025-03-04");
        assert!(r.warnings.is_empty());
    }

    #[test]
    fn non_object_rejected() {
        assert!(matches!(
            normalize(&json!([1, 2]), today(), None),
            Err(ExtractError::Parse(_))
        ));
    }

    #[test]
    fn provenance_kept_from_reply() {
        let r = normalize(&json!({"policy_id": "A", "pdf_url": "https://x/a.pdf"}), today(), None).unwrap();
        assert_eq!(r.record.source_url.as_deref(), Some("https://x/a.pdf"));
    }
}
