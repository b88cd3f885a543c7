//! Mines stylistic conventions from existing code and conforms generated
//! content to them.

use regex::Regex;

use crate::domain::models::{CodePatterns, IndentStyle, NamingConvention, QuoteStyle};

/// Extracts [`CodePatterns`] from code samples.
pub struct PatternExtractor {
    function_pattern: Regex,
    type_pattern: Regex,
    double_quoted: Regex,
    single_quoted: Regex,
}

impl PatternExtractor {
    pub fn new() -> Self {
        Self {
            function_pattern: Regex::new(r"\b(?:fn|def|func|function)\s+([A-Za-z_][A-Za-z0-9_]*)")
                .expect("function pattern is valid"),
            type_pattern: Regex::new(
                r"\b(?:struct|enum|trait|class|interface|type)\s+([A-Za-z_][A-Za-z0-9_]*)",
            )
            .expect("type pattern is valid"),
            double_quoted: Regex::new(r#""[^"\n]*""#).expect("quote pattern is valid"),
            single_quoted: Regex::new(r"'[^'\n]{2,}'").expect("quote pattern is valid"),
        }
    }

    /// Patterns from `samples` (retrieved chunks) plus the file being
    /// modified, if any. The existing file decides the trailing newline.
    pub fn extract<'a, I>(&self, samples: I, existing: Option<&str>) -> CodePatterns
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut texts: Vec<&str> = samples.into_iter().collect();
        if let Some(existing) = existing {
            texts.push(existing);
        }
        if texts.is_empty() {
            return CodePatterns {
                trailing_newline: true,
                ..CodePatterns::default()
            };
        }

        let functions: Vec<String> = texts.iter().flat_map(|t| self.function_names(t)).collect();
        let types: Vec<String> = texts.iter().flat_map(|t| self.type_names(t)).collect();

        let doubles: usize = texts.iter().map(|t| self.double_quoted.find_iter(t).count()).sum();
        let singles: usize = texts.iter().map(|t| self.single_quoted.find_iter(t).count()).sum();
        let quote_style = match (doubles, singles) {
            (0, 0) => None,
            (d, s) if d >= s => Some(QuoteStyle::Double),
            _ => Some(QuoteStyle::Single),
        };

        CodePatterns {
            indent: detect_indent(texts.iter().copied()),
            function_naming: majority_convention(&functions),
            type_naming: majority_convention(&types),
            quote_style,
            trailing_newline: existing.map_or(true, |e| e.is_empty() || e.ends_with('\n')),
            sample_size: texts.len(),
        }
    }

    pub fn function_names(&self, text: &str) -> Vec<String> {
        self.function_pattern
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect()
    }

    pub fn type_names(&self, text: &str) -> Vec<String> {
        self.type_pattern
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect()
    }
}

impl Default for PatternExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Most common naming convention; ties resolve in declaration order.
fn majority_convention(idents: &[String]) -> Option<NamingConvention> {
    const ORDER: [NamingConvention; 4] = [
        NamingConvention::SnakeCase,
        NamingConvention::CamelCase,
        NamingConvention::PascalCase,
        NamingConvention::ScreamingSnakeCase,
    ];
    let mut counts = [0usize; 4];
    for ident in idents {
        if let Some(found) = NamingConvention::classify(ident) {
            if let Some(slot) = ORDER.iter().position(|c| *c == found) {
                counts[slot] += 1;
            }
        }
    }

    let (best, count) = counts
        .iter()
        .enumerate()
        .fold((0, 0), |(bi, bc), (i, &c)| if c > bc { (i, c) } else { (bi, bc) });
    (count > 0).then_some(ORDER[best])
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Indentation used by the majority of indented lines.
pub fn detect_indent<'a, I>(texts: I) -> IndentStyle
where
    I: IntoIterator<Item = &'a str>,
{
    let mut tab_lines = 0usize;
    let mut space_lines = 0usize;
    let mut width = 0usize;

    for line in texts.into_iter().flat_map(str::lines) {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('*') {
            continue;
        }
        let leading = &line[..line.len() - trimmed.len()];
        if leading.starts_with('\t') {
            tab_lines += 1;
        } else if !leading.is_empty() {
            space_lines += 1;
            width = gcd(width, leading.len());
        }
    }

    if tab_lines > space_lines {
        IndentStyle::Tabs
    } else if (2..=8).contains(&width) {
        IndentStyle::Spaces(u8::try_from(width).unwrap_or(4))
    } else {
        IndentStyle::default()
    }
}

/// Re-indent `content` to the target style and apply the trailing newline
/// convention. Relative nesting is preserved.
pub fn conform(content: &str, patterns: &CodePatterns) -> String {
    let source = detect_indent([content]);
    let source_width = match source {
        IndentStyle::Spaces(w) => usize::from(w),
        IndentStyle::Tabs => 1,
    };
    let unit = patterns.indent.unit();

    let mut out: Vec<String> = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            out.push(String::new());
            continue;
        }
        let leading = &line[..line.len() - trimmed.len()];
        let (levels, remainder) = match source {
            IndentStyle::Tabs => {
                let tabs = leading.chars().take_while(|c| *c == '\t').count();
                (tabs, leading.len() - tabs)
            }
            IndentStyle::Spaces(_) => (leading.len() / source_width, leading.len() % source_width),
        };
        out.push(format!("{}{}{}", unit.repeat(levels), " ".repeat(remainder), trimmed));
    }

    let mut joined = out.join("\n");
    while joined.ends_with('\n') {
        joined.pop();
    }
    if patterns.trailing_newline {
        joined.push('\n');
    }
    joined
}
