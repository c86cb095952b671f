//! Mask tokens embedded in annotated seeds by the parser stage.
//!
//! `spec.md` §3 defines four variants, each carrying a 1-based ordinal
//! `number` that must be unique (but need not be contiguous) within one
//! annotation, a typing tag, and the original literal.

use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskKind {
    Constant,
    Operator,
    Function,
    Keyword,
}

impl MaskKind {
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "CONSTANT" => Some(Self::Constant),
            "OPERATOR" => Some(Self::Operator),
            "FUNCTION" => Some(Self::Function),
            "KEYWORD" => Some(Self::Keyword),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskToken {
    pub kind: MaskKind,
    pub number: u32,
    pub tag: String,
    pub ori: String,
}

static MASK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \[\s*(?P<kind>CONSTANT|OPERATOR|FUNCTION|KEYWORD)\s*,\s*
        number\s*:\s*(?P<number>\d+)\s*,\s*
        (?:type|category|context)\s*:\s*(?P<tag>[^,\]]*)\s*,\s*
        ori\s*:\s*(?P<ori>[^\]]*)\s*\]
        ",
    )
    .expect("mask pattern is a valid regex")
});

/// Scans annotated SQL text for mask tokens. Malformed bracket groups that do
/// not match the expected shape are silently skipped: the artifact contract
/// only requires that masks it *does* emit are well-formed, not that the
/// surrounding text contains no other bracketed content.
pub fn scan(annotated: &str) -> Vec<MaskToken> {
    MASK_PATTERN
        .captures_iter(annotated)
        .filter_map(|cap| {
            let kind = MaskKind::from_label(&cap["kind"])?;
            let number: u32 = cap["number"].parse().ok()?;
            Some(MaskToken {
                kind,
                number,
                tag: cap["tag"].trim().to_owned(),
                ori: cap["ori"].trim().to_owned(),
            })
        })
        .collect()
}

/// `spec.md` §3: "Numbers need not be contiguous ... but must be unique."
pub fn numbers_are_unique(tokens: &[MaskToken]) -> bool {
    let mut seen = std::collections::HashSet::new();
    tokens.iter().all(|t| seen.insert(t.number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_constant_masks() {
        let annotated = "SET x=[CONSTANT, number:1, type:enum_storage_engine, ori:ARCHIVE];";
        let tokens = scan(annotated);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, MaskKind::Constant);
        assert_eq!(tokens[0].number, 1);
        assert_eq!(tokens[0].tag, "enum_storage_engine");
        assert_eq!(tokens[0].ori, "ARCHIVE");
    }

    #[test]
    fn numbers_need_not_be_contiguous() {
        let annotated = "[CONSTANT, number:1, type:int, ori:1] [CONSTANT, number:3, type:int, ori:2]";
        let tokens = scan(annotated);
        assert_eq!(tokens.len(), 2);
        assert!(numbers_are_unique(&tokens));
    }

    #[test]
    fn duplicate_numbers_are_detected() {
        let annotated = "[CONSTANT, number:1, type:int, ori:1] [CONSTANT, number:1, type:int, ori:2]";
        let tokens = scan(annotated);
        assert!(!numbers_are_unique(&tokens));
    }

    #[test]
    fn no_masks_in_plain_sql() {
        let tokens = scan("SELECT 1;");
        assert!(tokens.is_empty());
    }
}
