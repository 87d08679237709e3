use chrono::NaiveDate;
use judsync_core::{CaseType, ParsedJudgment};
use serde_json::Value as JsonValue;

pub const MAX_FULL_TEXT_CHARS: usize = 50_000;
pub const SUMMARY_CHARS: usize = 500;
pub const MAX_PARTY_LINES: usize = 10;

/// Offset between the Minguo calendar year and the Gregorian year.
const ROC_YEAR_OFFSET: i32 = 1911;

const PARTY_ROLES: [&str; 12] = [
    "原告", "被告", "上訴人", "被上訴人", "聲請人", "相對人", "抗告人", "再抗告人", "債權人", "債務人", "自訴人",
    "公訴人",
];

/// Lines that end the party block at the top of a judgment.
const PARTY_BLOCK_END: [&str; 2] = ["上列", "主文"];

/// Turn a raw `JDoc` payload into normalized fields. Missing or malformed
/// fields become `None`; this never fails. The requested `jid` stays the key
/// even when the payload echoes a different `JID`.
pub fn parse_judgment(raw: &JsonValue, jid: &str) -> ParsedJudgment {
    let jid = match jid.trim() {
        "" => text_field(raw, "JID").unwrap_or_default(),
        requested => requested.to_string(),
    };
    let full_text = extract_full_text(raw);
    let title = text_field(raw, "JTITLE");

    let case_type = classify_case_type(
        [title.as_deref(), full_text.as_deref().and_then(first_line)]
            .into_iter()
            .flatten(),
        &jid,
    );
    let court_name = full_text.as_deref().and_then(extract_court_name);
    let parties = full_text.as_deref().and_then(extract_parties);
    let summary = full_text.as_deref().and_then(summarize);

    ParsedJudgment {
        case_number: case_number(raw),
        judgment_date: text_field(raw, "JDATE").as_deref().and_then(roc_date_to_gregorian),
        case_type,
        court_name,
        full_text: full_text.map(|text| truncate_chars(&text, MAX_FULL_TEXT_CHARS).to_string()),
        parties,
        summary,
        raw_payload: raw.clone(),
        jid,
    }
}

/// `"1130101"` (Minguo year 113) becomes 2024-01-01. Anything that is not
/// exactly seven ASCII digits forming a real date is `None`.
pub fn roc_date_to_gregorian(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.len() != 7 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year = raw[..3].parse::<i32>().ok()? + ROC_YEAR_OFFSET;
    let month = raw[3..5].parse::<u32>().ok()?;
    let day = raw[5..7].parse::<u32>().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Category tokens in the title or header win; otherwise fall back to the
/// court-code letter in the JID (`TPDM` criminal, `TPDV` civil, `TPBA`
/// administrative).
pub fn classify_case_type<'a>(texts: impl IntoIterator<Item = &'a str>, jid: &str) -> CaseType {
    for text in texts {
        if text.contains("刑事") {
            return CaseType::Criminal;
        }
        if text.contains("民事") || text.contains("家事") {
            return CaseType::Civil;
        }
        if text.contains("行政") {
            return CaseType::Administrative;
        }
    }
    let court_code = jid.split(',').next().unwrap_or_default();
    match court_code.chars().nth(3) {
        Some('M') => CaseType::Criminal,
        Some('V') => CaseType::Civil,
        Some('A') => CaseType::Administrative,
        _ => CaseType::Other,
    }
}

/// Court name from the judgment header, e.g. `臺灣臺北地方法院`.
pub fn extract_court_name(full_text: &str) -> Option<String> {
    let header = first_line(full_text)?;
    let compact = header.chars().filter(|c| !c.is_whitespace()).collect::<String>();
    let end = compact.find("法院")? + "法院".len();
    Some(compact[..end].to_string())
}

/// Role-prefixed lines from the party block, whitespace-collapsed and joined
/// by newlines.
pub fn extract_parties(full_text: &str) -> Option<String> {
    let mut lines = Vec::new();
    for line in full_text.lines().skip(1) {
        if PARTY_BLOCK_END.iter().any(|marker| strip_prefix_spaced(line, marker).is_some()) {
            break;
        }
        if PARTY_ROLES.iter().any(|role| strip_prefix_spaced(line, role).is_some()) {
            lines.push(collapse_whitespace(line));
            if lines.len() == MAX_PARTY_LINES {
                break;
            }
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Char-boundary-safe prefix of at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn summarize(full_text: &str) -> Option<String> {
    let collapsed = collapse_whitespace(full_text);
    if collapsed.is_empty() {
        return None;
    }
    Some(truncate_chars(&collapsed, SUMMARY_CHARS).to_string())
}

fn extract_full_text(raw: &JsonValue) -> Option<String> {
    raw.get("JFULLX")
        .and_then(|full| full.get("JFULLCONTENT"))
        .and_then(JsonValue::as_str)
        .or_else(|| raw.get("JFULLCONTENT").and_then(JsonValue::as_str))
        .or_else(|| raw.get("JFULL").and_then(JsonValue::as_str))
        .map(|text| text.replace("\r\n", "\n"))
        .filter(|text| !text.trim().is_empty())
}

fn case_number(raw: &JsonValue) -> Option<String> {
    let year = text_field(raw, "JYEAR")?;
    let case = text_field(raw, "JCASE")?;
    let number = text_field(raw, "JNO")?;
    Some(format!("{year}年度{case}字第{number}號"))
}

/// Trimmed, non-empty string field; numbers are accepted and rendered.
fn text_field(raw: &JsonValue, key: &str) -> Option<String> {
    let value = match raw.get(key)? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    (!value.is_empty()).then_some(value)
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}

/// Match `word` at the start of `line`, ignoring any whitespace (including
/// the full-width padding used in judgment headers) before and inside it.
fn strip_prefix_spaced<'a>(line: &'a str, word: &str) -> Option<&'a str> {
    let mut rest = line;
    for expected in word.chars() {
        rest = rest.trim_start();
        let mut chars = rest.chars();
        if chars.next()? != expected {
            return None;
        }
        rest = chars.as_str();
    }
    Some(rest)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
