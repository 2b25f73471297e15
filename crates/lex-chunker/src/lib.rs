pub mod patterns;

use chrono::Utc;
use lex_core::{LegalChunk, LegalDefinition};
use lex_error::{LexError, Result};
use tracing::{debug, instrument, warn};

pub use patterns::{default_definition_patterns, DefinitionPattern};

/// 法规切分配置
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// 法规简称，用于拼接引用（如 "VO (EU) 2021/1060"、"UStG"）
    pub instrument: String,
    /// 规范层级 1（条约）..7（非约束性指南），由调用方按文档类型声明
    pub hierarchy_level: u8,
    pub funding_period: Option<String>,
    pub jurisdiction: Option<String>,
    /// 超过该长度的段落继续按句子边界切分
    pub max_chunk_chars: usize,
}

impl ChunkerConfig {
    pub fn new(instrument: &str, hierarchy_level: u8) -> Self {
        Self {
            instrument: instrument.to_string(),
            hierarchy_level: hierarchy_level.clamp(1, 7),
            funding_period: None,
            jurisdiction: None,
            max_chunk_chars: 1200,
        }
    }

    pub fn with_funding_period(mut self, period: &str) -> Self {
        self.funding_period = Some(period.to_string());
        self
    }
}

/// 切分结果：引用可寻址的块 + 抽取出的术语定义
#[derive(Debug, Clone, Default)]
pub struct ChunkOutput {
    pub chunks: Vec<LegalChunk>,
    pub definitions: Vec<LegalDefinition>,
}

/// 法规切分器
///
/// 沿结构标记（条款/章节/段落边界）切分而不是固定窗口，
/// 使每个块精确对应一个稳定引用。没有任何结构标记的输入
/// 回退为固定大小切分并使用合成引用，切分永不失败。
pub struct LegalChunker {
    config: ChunkerConfig,
    definition_patterns: Vec<DefinitionPattern>,
}

// 切分过程中的中间片段
struct Piece {
    content: String,
    citation: String,
    article: Option<String>,
    paragraph: Option<String>,
    subparagraph: Option<String>,
}

impl LegalChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            config,
            definition_patterns: patterns::default_definition_patterns(),
        }
    }

    /// 替换定义抽取模式集（司法辖区扩展点）
    pub fn with_definition_patterns(mut self, patterns: Vec<DefinitionPattern>) -> Self {
        self.definition_patterns = patterns;
        self
    }

    /// 将原始法规文本切分为有序块序列和定义集合。
    ///
    /// 保证：chunk_index 从 0 连续递增；norm_citation 非空；
    /// 所有块内容按序拼接（忽略边界空白）可还原原文。
    #[instrument(skip(self, text))]
    pub fn chunk(&self, source_id: &str, text: &str) -> Result<ChunkOutput> {
        if text.trim().is_empty() {
            return Err(LexError::Chunking {
                source_id: source_id.to_string(),
                message: "source text is empty".to_string(),
            });
        }

        let markers: Vec<(usize, String, bool)> = patterns::STRUCTURAL_MARKER
            .captures_iter(text)
            .map(|cap| {
                let m = cap.get(0).unwrap();
                if let Some(article) = cap.get(1) {
                    (m.start(), article.as_str().to_string(), true)
                } else {
                    (m.start(), cap.get(2).unwrap().as_str().to_string(), false)
                }
            })
            .collect();

        let pieces = if markers.is_empty() {
            warn!(
                source_id = %source_id,
                "no structural markers found, falling back to fixed-size chunking"
            );
            self.fallback_pieces(source_id, text)
        } else {
            self.structural_pieces(text, &markers)
        };

        let mut output = ChunkOutput::default();
        let total = pieces.len();
        let now = Utc::now();

        for (index, piece) in pieces.into_iter().enumerate() {
            let cross_references = self.extract_cross_references(&piece);
            let (definitions, terms) = self.extract_definitions(&piece);
            output.definitions.extend(definitions);

            output.chunks.push(LegalChunk {
                content: piece.content,
                norm_citation: piece.citation,
                article: piece.article,
                paragraph: piece.paragraph,
                subparagraph: piece.subparagraph,
                hierarchy_level: self.config.hierarchy_level,
                cross_references,
                definitions_used: terms,
                chunk_index: index,
                total_chunks: total,
                funding_period: self.config.funding_period.clone(),
                source_id: source_id.to_string(),
                created_at: now,
            });
        }

        debug!(
            source_id = %source_id,
            chunks = output.chunks.len(),
            definitions = output.definitions.len(),
            "legal source chunked"
        );
        Ok(output)
    }

    // 沿结构标记切分；标记前的前言文本保留为首块
    fn structural_pieces(&self, text: &str, markers: &[(usize, String, bool)]) -> Vec<Piece> {
        let mut pieces = Vec::new();

        let preamble = &text[..markers[0].0];
        if !preamble.trim().is_empty() {
            pieces.push(Piece {
                content: preamble.trim().to_string(),
                citation: self.config.instrument.clone(),
                article: None,
                paragraph: None,
                subparagraph: None,
            });
        }

        for (i, (start, number, is_article)) in markers.iter().enumerate() {
            let end = markers.get(i + 1).map(|m| m.0).unwrap_or(text.len());
            let segment = &text[*start..end];
            if segment.trim().is_empty() {
                continue;
            }

            let citation = if *is_article {
                format!("Art. {} {}", number, self.config.instrument)
                    .trim_end()
                    .to_string()
            } else {
                format!("§ {} {}", number, self.config.instrument)
                    .trim_end()
                    .to_string()
            };
            let article = is_article.then(|| number.clone());
            let section = (!is_article).then(|| number.clone());

            if segment.chars().count() <= self.config.max_chunk_chars {
                pieces.push(Piece {
                    content: segment.trim().to_string(),
                    citation,
                    article: article.clone().or(section.clone()),
                    paragraph: None,
                    subparagraph: None,
                });
                continue;
            }

            self.split_segment(segment, &citation, article.or(section), &mut pieces);
        }

        pieces
    }

    // 超长条款：优先沿编号段落边界，仍超长时按句子边界，
    // 保留父引用并附加 Satz 级别的消歧标记
    fn split_segment(
        &self,
        segment: &str,
        citation: &str,
        article: Option<String>,
        pieces: &mut Vec<Piece>,
    ) {
        let para_marks: Vec<(usize, String)> = patterns::PARAGRAPH_MARKER
            .captures_iter(segment)
            .map(|cap| {
                (
                    cap.get(0).unwrap().start(),
                    cap.get(1).unwrap().as_str().to_string(),
                )
            })
            .collect();

        let mut spans: Vec<(usize, usize, Option<String>)> = Vec::new();
        if para_marks.is_empty() {
            spans.push((0, segment.len(), None));
        } else {
            if para_marks[0].0 > 0 {
                spans.push((0, para_marks[0].0, None));
            }
            for (i, (start, num)) in para_marks.iter().enumerate() {
                let end = para_marks.get(i + 1).map(|m| m.0).unwrap_or(segment.len());
                spans.push((*start, end, Some(num.clone())));
            }
        }

        for (start, end, paragraph) in spans {
            let part = &segment[start..end];
            if part.trim().is_empty() {
                continue;
            }
            if part.chars().count() <= self.config.max_chunk_chars {
                pieces.push(Piece {
                    content: part.trim().to_string(),
                    citation: citation.to_string(),
                    article: article.clone(),
                    paragraph: paragraph.clone(),
                    subparagraph: None,
                });
                continue;
            }

            for (satz, (s, e)) in
                accumulate_sentences(part, self.config.max_chunk_chars).into_iter().enumerate()
            {
                let sentence_part = &part[s..e];
                if sentence_part.trim().is_empty() {
                    continue;
                }
                pieces.push(Piece {
                    content: sentence_part.trim().to_string(),
                    citation: citation.to_string(),
                    article: article.clone(),
                    paragraph: paragraph.clone(),
                    subparagraph: Some(format!("Satz {}", satz + 1)),
                });
            }
        }
    }

    // 固定大小回退切分，合成引用 "Chunk N of <source>"
    fn fallback_pieces(&self, source_id: &str, text: &str) -> Vec<Piece> {
        let mut contents = Vec::new();
        let mut current = String::new();
        let mut current_chars = 0usize;

        for word in text.split_whitespace() {
            let word_chars = word.chars().count();
            if !current.is_empty() && current_chars + word_chars + 1 > self.config.max_chunk_chars {
                contents.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            if !current.is_empty() {
                current.push(' ');
                current_chars += 1;
            }
            current.push_str(word);
            current_chars += word_chars;
        }
        if !current.trim().is_empty() {
            contents.push(current);
        }

        contents
            .into_iter()
            .enumerate()
            .map(|(i, content)| Piece {
                content,
                citation: format!("Chunk {} of {}", i, source_id),
                article: None,
                paragraph: None,
                subparagraph: None,
            })
            .collect()
    }

    fn extract_cross_references(&self, piece: &Piece) -> Vec<String> {
        let own_head = piece
            .article
            .as_ref()
            .map(|n| {
                if piece.citation.starts_with('§') {
                    format!("§ {}", n)
                } else {
                    format!("Art. {}", n)
                }
            })
            .unwrap_or_default();

        let mut refs: Vec<String> = Vec::new();
        for m in patterns::CROSS_REFERENCE.find_iter(&piece.content) {
            let text = normalize_citation(m.as_str());
            // 排除块自身的标题引用
            if !own_head.is_empty() && text == own_head {
                continue;
            }
            if !refs.contains(&text) {
                refs.push(text);
            }
        }
        refs
    }

    // 按优先级尝试模式；同一位置上首个命中生效
    fn extract_definitions(&self, piece: &Piece) -> (Vec<LegalDefinition>, Vec<String>) {
        let mut claimed: Vec<(usize, usize)> = Vec::new();
        let mut definitions = Vec::new();
        let mut terms = Vec::new();

        for pattern in &self.definition_patterns {
            for cap in pattern.regex.captures_iter(&piece.content) {
                let m = cap.get(0).unwrap();
                if claimed
                    .iter()
                    .any(|(s, e)| m.start() < *e && m.end() > *s)
                {
                    continue;
                }
                let term = match cap.get(pattern.term_group) {
                    Some(t) => t.as_str().trim().to_string(),
                    None => continue,
                };
                let definition = match cap.get(pattern.definition_group) {
                    Some(d) => d.as_str().trim().trim_end_matches('.').to_string(),
                    None => continue,
                };
                if term.is_empty() || definition.is_empty() {
                    continue;
                }
                claimed.push((m.start(), m.end()));
                if !terms.contains(&term) {
                    terms.push(term.clone());
                }
                definitions.push(LegalDefinition {
                    term,
                    definition,
                    norm_citation: piece.citation.clone(),
                    funding_period: self.config.funding_period.clone(),
                });
            }
        }

        (definitions, terms)
    }
}

// 句子边界累积：按字符数计量，返回片段字节区间，单个超长句子保持完整
fn accumulate_sentences(text: &str, max_chars: usize) -> Vec<(usize, usize)> {
    let mut boundaries = Vec::new();
    let mut prev_punct = false;
    for (idx, ch) in text.char_indices() {
        if prev_punct && ch.is_whitespace() {
            boundaries.push(idx);
        }
        prev_punct = matches!(ch, '.' | '!' | '?');
    }

    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut last = 0usize;
    for b in boundaries {
        if text[start..b].chars().count() > max_chars && last > start {
            spans.push((start, last));
            start = last;
        }
        last = b;
    }
    if text[start..].chars().count() > max_chars && last > start {
        spans.push((start, last));
        start = last;
    }
    if start < text.len() {
        spans.push((start, text.len()));
    }
    spans
}

fn normalize_citation(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.replace("Artikel ", "Art. ").replace("§", "§ ").replace("§  ", "§ ")
}
