use regex::Regex;
use serde::Serialize;

use crate::domain::{Filter, FilterSpec};
use crate::error::KiraError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "name", rename_all = "lowercase")]
pub enum Decision {
    Keep(String),
    Discard,
}

impl Decision {
    pub fn is_keep(&self) -> bool {
        matches!(self, Decision::Keep(_))
    }
}

#[derive(Debug, Clone)]
struct CompiledFilter {
    position: u32,
    regex: Regex,
    inverted: bool,
    replacement: Option<String>,
}

impl CompiledFilter {
    fn decides(&self, name: &str) -> bool {
        self.regex.is_match(name) != self.inverted
    }

    fn rename(&self, name: &str) -> String {
        match &self.replacement {
            Some(replacement) => self
                .regex
                .replace_all(name, replacement.as_str())
                .into_owned(),
            None => name.to_string(),
        }
    }
}

/// Ordered first-decision-wins filter list for one source.
///
/// A filter decides when its match result differs from its `inverted` flag.
/// The first deciding filter keeps the entry under its (possibly mapped)
/// name. If no filter decides the entry is discarded, unless the source has
/// no filters at all, in which case every entry passes through unchanged.
#[derive(Debug, Clone, Default)]
pub struct FilterPipeline {
    filters: Vec<CompiledFilter>,
}

impl FilterPipeline {
    pub fn compile(filters: &[Filter]) -> Result<Self, KiraError> {
        let mut ordered = filters.iter().collect::<Vec<_>>();
        ordered.sort_by_key(|filter| filter.position);
        let filters = ordered
            .into_iter()
            .map(|filter| {
                let regex = compile_pattern(&filter.pattern)?;
                let replacement = if filter.mapping.is_empty() {
                    None
                } else {
                    Some(translate_mapping(&filter.mapping, &regex)?)
                };
                Ok(CompiledFilter {
                    position: filter.position,
                    regex,
                    inverted: filter.inverted,
                    replacement,
                })
            })
            .collect::<Result<Vec<_>, KiraError>>()?;
        Ok(Self { filters })
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn apply(&self, name: &str) -> Decision {
        if self.filters.is_empty() {
            return Decision::Keep(name.to_string());
        }
        for filter in &self.filters {
            if filter.decides(name) {
                tracing::trace!(position = filter.position, name, "filter decided");
                return Decision::Keep(filter.rename(name));
            }
        }
        Decision::Discard
    }
}

pub fn validate_filter(spec: &FilterSpec) -> Result<(), KiraError> {
    let regex = compile_pattern(&spec.pattern)?;
    if !spec.mapping.is_empty() {
        translate_mapping(&spec.mapping, &regex)?;
    }
    Ok(())
}

pub fn build_filters(specs: &[FilterSpec]) -> Result<Vec<Filter>, KiraError> {
    specs
        .iter()
        .enumerate()
        .map(|(position, spec)| {
            validate_filter(spec)?;
            Ok(Filter {
                position: position as u32,
                pattern: spec.pattern.clone(),
                inverted: spec.inverted,
                mapping: spec.mapping.clone(),
            })
        })
        .collect()
}

fn compile_pattern(pattern: &str) -> Result<Regex, KiraError> {
    Regex::new(pattern).map_err(|err| KiraError::InvalidFilterPattern {
        pattern: pattern.to_string(),
        message: err.to_string(),
    })
}

pub fn translate_mapping(mapping: &str, regex: &Regex) -> Result<String, KiraError> {
    let available = regex.captures_len() - 1;
    let chars = mapping.chars().collect::<Vec<_>>();
    let mut out = String::with_capacity(mapping.len() + 8);
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        match ch {
            '$' => {
                out.push_str("$$");
                i += 1;
            }
            '\\' if i + 1 < chars.len() => {
                let next = chars[i + 1];
                if next == '\\' {
                    out.push('\\');
                    i += 2;
                } else if next.is_ascii_digit() {
                    let mut end = i + 2;
                    if end < chars.len() && chars[end].is_ascii_digit() {
                        end += 1;
                    }
                    let digits = chars[i + 1..end].iter().collect::<String>();
                    let group = digits.parse::<usize>().unwrap_or(0);
                    if group == 0 || group > available {
                        return Err(KiraError::InvalidFilterMapping {
                            mapping: mapping.to_string(),
                            group: digits,
                            available,
                        });
                    }
                    out.push_str(&format!("${{{group}}}"));
                    i = end;
                } else if next == 'g' && chars.get(i + 2) == Some(&'<') {
                    let close = chars[i + 3..]
                        .iter()
                        .position(|ch| *ch == '>')
                        .map(|offset| i + 3 + offset);
                    let Some(close) = close else {
                        out.push('\\');
                        i += 1;
                        continue;
                    };
                    let group = chars[i + 3..close].iter().collect::<String>();
                    let known = match group.parse::<usize>() {
                        Ok(index) => index >= 1 && index <= available,
                        Err(_) => regex.capture_names().flatten().any(|name| name == group),
                    };
                    if !known {
                        return Err(KiraError::InvalidFilterMapping {
                            mapping: mapping.to_string(),
                            group,
                            available,
                        });
                    }
                    out.push_str(&format!("${{{group}}}"));
                    i = close + 1;
                } else {
                    out.push('\\');
                    i += 1;
                }
            }
            _ => {
                out.push(ch);
                i += 1;
            }
        }
    }
    Ok(out)
}
