//! Synchronous regex-based content policy check.
//!
//! Pattern list ported from the original Python `ContentFilter` 1:1; ordering
//! matters since the first match wins.

use regex::Regex;

/// An ordered, compiled list of (pattern, reason) checks. First match wins.
pub struct ContentFilter {
    compiled: Vec<(Regex, &'static str)>,
}

const BLOCKED_PATTERNS: &[(&str, &str)] = &[
    // English hate speech
    (
        r"\b(?:kill\s+all|exterminate|genocide)\b",
        "Incitement to violence/genocide",
    ),
    (
        r"\b(?:racial\s+supremacy|white\s+power|ethnic\s+cleansing)\b",
        "Hate speech (supremacism)",
    ),
    (
        r"\b(?:gas\s+the|lynch|enslave)\s+\w+",
        "Hate speech (violence against groups)",
    ),
    // English violence
    (
        r"\b(?:how\s+to\s+(?:make\s+a\s+bomb|build\s+(?:a\s+)?weapon|synthesize\s+poison))\b",
        "Illegal activity instructions",
    ),
    (
        r"\b(?:terrorist\s+attack\s+plan|mass\s+(?:shooting|murder)\s+guide)\b",
        "Terrorism-related content",
    ),
    // English illegal activity
    (
        r"\b(?:how\s+to\s+(?:hack|steal\s+identity|launder\s+money|traffic\s+(?:drugs|humans)))\b",
        "Illegal activity instructions",
    ),
    (
        r"\b(?:child\s+(?:porn|exploitation|abuse))\b",
        "Child exploitation content",
    ),
    // Korean hate speech
    (
        r"(?:인종\s*청소|민족\s*말살|학살\s*해야)",
        "혐오 발언 (인종/민족)",
    ),
    (
        r"(?:여성\s*혐오|남성\s*혐오|장애인\s*혐오).*(?:죽|없애|제거)",
        "혐오 발언 (차별적 폭력)",
    ),
    // Korean violence
    (
        r"(?:폭탄\s*(?:만들|제조)|무기\s*제작|독극물\s*합성)",
        "불법 활동 지침",
    ),
    (r"(?:테러\s*계획|총기\s*난사\s*방법)", "테러 관련 콘텐츠"),
    // Korean illegal activity
    (
        r"(?:마약\s*(?:제조|거래)|인신\s*매매|자금\s*세탁\s*방법)",
        "불법 활동 지침",
    ),
    (
        r"(?:아동\s*(?:포르노|착취|학대))",
        "아동 착취 콘텐츠",
    ),
];

impl Default for ContentFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentFilter {
    /// Compiles the blocked-pattern list once. Panics only if a pattern fails
    /// to compile, which would be a programmer error in the list above.
    #[must_use]
    pub fn new() -> Self {
        let compiled = BLOCKED_PATTERNS
            .iter()
            .map(|(pattern, reason)| {
                let regex = Regex::new(&format!("(?i){pattern}"))
                    .unwrap_or_else(|e| panic!("invalid content filter pattern {pattern:?}: {e}"));
                (regex, *reason)
            })
            .collect();

        Self { compiled }
    }

    /// Returns `Ok(())` if `text` is safe, `Err(reason)` on the first matched
    /// blocked pattern.
    pub fn check(&self, text: &str) -> Result<(), &'static str> {
        for (regex, reason) in &self.compiled {
            if regex.is_match(text) {
                return Err(reason);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_text_passes() {
        let filter = ContentFilter::new();
        assert!(filter.check("Renewable energy reduces long-term costs.").is_ok());
    }

    #[test]
    fn test_incitement_blocked() {
        let filter = ContentFilter::new();
        let result = filter.check("We should exterminate them all.");
        assert_eq!(result, Err("Incitement to violence/genocide"));
    }

    #[test]
    fn test_case_insensitive() {
        let filter = ContentFilter::new();
        assert_eq!(
            filter.check("How To Make A Bomb at home"),
            Err("Illegal activity instructions")
        );
    }

    #[test]
    fn test_korean_pattern_blocked() {
        let filter = ContentFilter::new();
        assert_eq!(
            filter.check("이것은 인종 청소에 대한 내용입니다"),
            Err("혐오 발언 (인종/민족)")
        );
    }

    #[test]
    fn test_first_match_wins() {
        // Matches both the genocide pattern and (incidentally) nothing else here,
        // but documents that only the first configured match is ever returned.
        let filter = ContentFilter::new();
        let reason = filter.check("kill all of them and also build a weapon");
        assert_eq!(reason, Err("Incitement to violence/genocide"));
    }
}
