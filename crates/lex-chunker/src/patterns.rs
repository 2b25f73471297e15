use once_cell::sync::Lazy;
use regex::Regex;

/// 结构标记：行首的条款/章节标题（Artikel 5 / Art. 5 / § 14）
pub static STRUCTURAL_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:(?:Artikel|Art\.)[ \t]+(\d+[a-z]?)|§[ \t]*(\d+[a-z]?))")
        .expect("invalid structural marker regex")
});

/// 段落标记：行首的编号段落 (1) (2) ...
pub static PARAGRAPH_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*\((\d+)\)").expect("invalid paragraph marker regex"));

/// 交叉引用：块内出现的引用形状的子串，按字面记录，不做解析
pub static CROSS_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:Artikel|Art\.)\s*\d+[a-z]?(?:\s+(?:der\s+)?(?:VO|Verordnung)\s*\(E[UG]\)\s*(?:Nr\.\s*)?\d{4}/\d+)?|§\s*\d+[a-z]?(?:\s+[A-ZÄÖÜ][A-Za-zäöüß]*G\b)?|(?:Absatz|Abs\.)\s*\d+",
    )
    .expect("invalid cross reference regex")
});

/// 定义抽取模式：按优先级顺序尝试，位置上首个命中生效
#[derive(Debug, Clone)]
pub struct DefinitionPattern {
    pub name: &'static str,
    pub regex: Regex,
    pub term_group: usize,
    pub definition_group: usize,
}

/// 默认模式集。调用方可以替换整个列表来加入
/// 司法辖区特有的模式，而不触碰块装配逻辑。
pub fn default_definition_patterns() -> Vec<DefinitionPattern> {
    vec![
        // 1. „Begriff" bezeichnet/bedeutet/ist ...  （编号列表中的定义条目）
        DefinitionPattern {
            name: "numbered_quoted_term_de",
            regex: Regex::new(
                r#"(?m)^\s*\d+\.\s*[„"»]([^"„“”«»]+)["“”«»]?\s*(?:bezeichnet|bedeutet|ist|meint)\s+([^;\n]+)"#,
            )
            .expect("invalid definition regex"),
            term_group: 1,
            definition_group: 2,
        },
        // 2. 非编号的引号定义
        DefinitionPattern {
            name: "quoted_term_de",
            regex: Regex::new(
                r#"[„"»]([^"„“”«»]+)["“”«»]\s+(?:bezeichnet|bedeutet|ist)\s+([^;\n]+)"#,
            )
            .expect("invalid definition regex"),
            term_group: 1,
            definition_group: 2,
        },
        // 3. "term" means ...
        DefinitionPattern {
            name: "quoted_term_en",
            regex: Regex::new(r#""([^"]+)"\s+means\s+([^;\n]+)"#)
                .expect("invalid definition regex"),
            term_group: 1,
            definition_group: 2,
        },
    ]
}
