use std::path::PathBuf;

use chrono::NaiveDate;
use judsync_adapters::{collect_ids, detail_outcome_from_response, parse_judgment, DetailOutcome};
use judsync_core::CaseType;
use serde_json::Value as JsonValue;

fn fixture(name: &str) -> JsonValue {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/judicial")
        .join(name);
    let raw = std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()));
    serde_json::from_str(&raw).unwrap()
}

#[test]
fn civil_fixture_parses() {
    let raw = fixture("jdoc_civil.json");
    let parsed = parse_judgment(&raw, "TPDV,112,訴,4567,20240102,1");

    assert_eq!(parsed.case_number.as_deref(), Some("112年度訴字第4567號"));
    assert_eq!(parsed.judgment_date, NaiveDate::from_ymd_opt(2024, 1, 2));
    assert_eq!(parsed.case_type, CaseType::Civil);
    assert_eq!(parsed.court_name.as_deref(), Some("臺灣臺北地方法院"));
    let parties = parsed.parties.unwrap();
    assert_eq!(parties.lines().count(), 2);
    assert!(parties.contains("大同貿易股份有限公司"));
    assert!(parties.contains("光明科技股份有限公司"));
    assert!(!parsed.full_text.unwrap().contains('\r'));
}

#[test]
fn criminal_fixture_parses_numeric_fields() {
    let raw = fixture("jdoc_criminal_fraud.json");
    let parsed = parse_judgment(&raw, "TPDM,112,金訴,88,20240101,2");

    assert_eq!(parsed.case_number.as_deref(), Some("112年度金訴字第88號"));
    assert_eq!(parsed.judgment_date, NaiveDate::from_ymd_opt(2024, 1, 1));
    assert_eq!(parsed.case_type, CaseType::Criminal);
    assert!(parsed.full_text.unwrap().contains("背信"));
}

#[test]
fn not_found_fixture_is_a_terminal_outcome() {
    let outcome = detail_outcome_from_response(fixture("jdoc_not_found.json")).unwrap();
    assert_eq!(outcome, DetailOutcome::NotFound);
}

#[test]
fn dated_list_fixture_flattens_in_order() {
    let ids = collect_ids(&fixture("jlist_dated.json"), 50).unwrap();
    assert_eq!(
        ids,
        vec![
            "TPDM,112,金訴,88,20240101,2",
            "TPDV,112,訴,4567,20240102,1",
            "TPSV,113,台上,12,20240102,1",
        ]
    );
}
