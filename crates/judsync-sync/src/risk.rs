use judsync_core::RiskLevel;

/// Fraud, breach of trust, money laundering, embezzlement, forgery, asset
/// stripping, insider trading, securities violations.
pub const HIGH_RISK_KEYWORDS: [&str; 8] = ["詐欺", "背信", "洗錢", "侵占", "偽造", "掏空", "內線交易", "違反證券交易法"];

/// Breach of contract, damages, payment, debt, repayment.
pub const MEDIUM_RISK_KEYWORDS: [&str; 5] = ["違約", "損害賠償", "給付", "債務", "清償"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeywordHits {
    pub high: usize,
    pub medium: usize,
}

/// Number of distinct keywords from each category present in `text`.
pub fn keyword_hits(text: &str) -> KeywordHits {
    let count = |keywords: &[&str]| keywords.iter().filter(|needle| text.contains(*needle)).count();
    KeywordHits {
        high: count(&HIGH_RISK_KEYWORDS[..]),
        medium: count(&MEDIUM_RISK_KEYWORDS[..]),
    }
}

/// Two high-risk hits make a record HIGH; one high-risk hit or three
/// medium-risk hits make it MEDIUM.
pub fn classify_risk(text: &str) -> RiskLevel {
    let hits = keyword_hits(text);
    if hits.high >= 2 {
        RiskLevel::High
    } else if hits.high >= 1 || hits.medium >= 3 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_high_risk_keywords_are_high() {
        assert_eq!(classify_risk("被告涉犯詐欺及背信等罪"), RiskLevel::High);
    }

    #[test]
    fn single_high_or_three_medium_is_medium() {
        assert_eq!(classify_risk("被告涉嫌洗錢"), RiskLevel::Medium);
        assert_eq!(classify_risk("請求損害賠償並給付違約金"), RiskLevel::Medium);
    }

    #[test]
    fn sparse_or_empty_text_is_low() {
        assert_eq!(classify_risk(""), RiskLevel::Low);
        assert_eq!(classify_risk("請求給付貨款及清償"), RiskLevel::Low);
    }

    #[test]
    fn repeated_keyword_counts_once() {
        let hits = keyword_hits("詐欺、詐欺、再詐欺");
        assert_eq!(hits, KeywordHits { high: 1, medium: 0 });
        assert_eq!(classify_risk("詐欺、詐欺、再詐欺"), RiskLevel::Medium);
    }

    #[test]
    fn classification_is_deterministic() {
        let text = "違反證券交易法之內線交易案件";
        assert_eq!(classify_risk(text), classify_risk(text));
        assert_eq!(classify_risk(text), RiskLevel::High);
    }
}
