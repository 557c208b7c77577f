use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SqyError};
use crate::format::MAX_PIPELINE_LEN;
use crate::registry::{Registry, StageEntry};
use crate::stage::Stage;

/// Token between stages in a pipeline name.
pub const STAGE_SEPARATOR: &str = "->";

/// One resolved stage of a pipeline: registry name, optional variant and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    pub name: &'static str,
    pub variant: Option<u32>,
    pub args: BTreeMap<String, String>,
}

impl StageDescriptor {
    pub fn new(name: &'static str, variant: Option<u32>) -> Self {
        Self {
            name,
            variant,
            args: BTreeMap::new(),
        }
    }

    /// Parse argument `key`, falling back to `default` when absent.
    pub fn arg<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.args.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                SqyError::invalid_pipeline(self.to_string(), format!("bad value {raw:?} for '{key}'"))
            }),
        }
    }

    /// Like [`StageDescriptor::arg`] but also enforces `min..=max`.
    pub fn arg_in<T>(&self, key: &str, default: T, min: T, max: T) -> Result<T>
    where
        T: FromStr + PartialOrd + fmt::Display,
    {
        let value = self.arg(key, default)?;
        if value < min || value > max {
            return Err(SqyError::invalid_pipeline(
                self.to_string(),
                format!("'{key}' must lie in {min}..={max}, got {value}"),
            ));
        }
        Ok(value)
    }
}

impl fmt::Display for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)?;
        if let Some(v) = self.variant {
            write!(f, "{v}")?;
        }
        if !self.args.is_empty() {
            let args: Vec<String> = self.args.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "({})", args.join(","))?;
        }
        Ok(())
    }
}

/// Ordered, validated chain of stages parsed from a name like `"bitswap1->lz4"`.
///
/// Two pipelines are equal when their descriptor sequences are equal, so
/// `"lz4(framestep_kb=256)"` and `" lz4 "` are different pipelines even though
/// they encode identically.
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<StageDescriptor>,
    entries: Vec<&'static StageEntry>,
}

impl Pipeline {
    /// Tokenize `text` on [`STAGE_SEPARATOR`] and validate every segment
    /// against `registry`. Nothing is built and no buffer is touched.
    pub fn parse(text: &str, registry: &Registry) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(SqyError::invalid_pipeline(text, "empty pipeline"));
        }
        let mut stages = Vec::new();
        let mut entries = Vec::new();
        for segment in text.split(STAGE_SEPARATOR) {
            let (entry, descriptor) = parse_segment(text, segment.trim(), registry)?;
            (entry.check)(&descriptor)?;
            stages.push(descriptor);
            entries.push(entry);
        }
        if stages.len() > u8::MAX as usize {
            return Err(SqyError::invalid_pipeline(text, "too many stages"));
        }
        let pipeline = Self { stages, entries };
        let canonical_len = pipeline.to_string().len();
        if canonical_len > MAX_PIPELINE_LEN {
            return Err(SqyError::invalid_pipeline(
                text,
                format!("canonical name is {canonical_len} bytes, at most {MAX_PIPELINE_LEN} fit a header"),
            ));
        }
        Ok(pipeline)
    }

    /// Feasibility query: `true` iff [`Pipeline::parse`] would succeed.
    pub fn is_possible(text: &str, registry: &Registry) -> bool {
        Self::parse(text, registry).is_ok()
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Instantiate every stage, first to last.
    pub fn build(&self) -> Result<Vec<Box<dyn Stage>>> {
        self.entries
            .iter()
            .zip(&self.stages)
            .map(|(entry, descriptor)| (entry.build)(descriptor))
            .collect()
    }
}

impl PartialEq for Pipeline {
    fn eq(&self, other: &Self) -> bool {
        self.stages == other.stages
    }
}

impl Eq for Pipeline {}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pipeline").field(&self.stages).finish()
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(STAGE_SEPARATOR)?;
            }
            write!(f, "{stage}")?;
        }
        Ok(())
    }
}

// ── Segment grammar ────────────────────────────────────────────────────────

fn is_token(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_value(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '+'))
}

/// Canonical spelling of an argument value, so that `level=03` and
/// `level=3` name the same pipeline. Integers lose sign and leading zeros,
/// plain decimals take their shortest form, anything else stays verbatim.
fn canonical_value(value: &str) -> String {
    if let Ok(n) = value.parse::<i128>() {
        return n.to_string();
    }
    let decimal = value.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+'));
    match value.parse::<f64>() {
        Ok(x) if decimal && x.is_finite() => x.to_string(),
        _ => value.to_string(),
    }
}

/// `token [ "(" key=value ("," key=value)* ")" ]`
fn parse_segment(
    pipeline: &str,
    segment: &str,
    registry: &Registry,
) -> Result<(&'static StageEntry, StageDescriptor)> {
    let bad = |reason: String| SqyError::invalid_pipeline(pipeline, reason);

    if segment.is_empty() {
        return Err(bad("empty stage".into()));
    }
    let (token, arg_text) = match segment.find('(') {
        None => (segment, None),
        Some(open) => {
            let inner = segment[open + 1..]
                .strip_suffix(')')
                .ok_or_else(|| bad(format!("unclosed argument list in '{segment}'")))?;
            (segment[..open].trim_end(), Some(inner))
        }
    };
    if !is_token(token) {
        return Err(bad(format!("malformed stage token '{token}'")));
    }
    let (entry, variant) = registry
        .resolve(token)
        .ok_or_else(|| bad(format!("unknown stage '{token}'")))?;

    let mut descriptor = StageDescriptor::new(entry.name, variant);
    if let Some(arg_text) = arg_text {
        for arg in arg_text.split(',') {
            let (key, value) = arg
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| bad(format!("argument '{}' is not key=value", arg.trim())))?;
            if !is_token(key) || !is_value(value) {
                return Err(bad(format!("malformed argument '{}'", arg.trim())));
            }
            if !entry.args.contains(&key) {
                return Err(bad(format!("stage '{}' has no argument '{key}'", entry.name)));
            }
            if descriptor.args.insert(key.to_string(), canonical_value(value)).is_some() {
                return Err(bad(format!("argument '{key}' given twice")));
            }
        }
    }
    Ok((entry, descriptor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{build_stage, check_stage};
    use crate::stage::{FromDescriptor, StageContext, StageMeta};
    use crate::types::{ElementType, Layout};

    struct Echo {
        level: u32,
    }

    impl FromDescriptor for Echo {
        fn from_descriptor(d: &StageDescriptor) -> Result<Self> {
            Ok(Self {
                level: d.arg_in("level", 1, 1, 9)?,
            })
        }
    }

    impl Stage for Echo {
        fn name(&self) -> &'static str {
            "copy"
        }
        fn output_element(&self, input: ElementType) -> Result<ElementType> {
            Ok(input)
        }
        fn max_encoded_size(&self, input_len: usize) -> usize {
            input_len.saturating_add(self.level as usize)
        }
        fn encode(
            &self,
            input: &[u8],
            _layout: &Layout,
            output: &mut [u8],
            _meta: &mut StageMeta,
            _ctx: &StageContext,
        ) -> Result<usize> {
            output[..input.len()].copy_from_slice(input);
            Ok(input.len())
        }
        fn decode(
            &self,
            input: &[u8],
            _layout: &Layout,
            _meta: &StageMeta,
            output: &mut [u8],
            _ctx: &StageContext,
        ) -> Result<()> {
            output.copy_from_slice(input);
            Ok(())
        }
    }

    static ENTRIES: [StageEntry; 2] = [
        StageEntry {
            name: "copy",
            variants: &[],
            args: &["level", "tag"],
            lossy: false,
            summary: "test stage",
            check: check_stage::<Echo>,
            build: build_stage::<Echo>,
        },
        StageEntry {
            name: "swap",
            variants: &[1, 2, 8],
            args: &[],
            lossy: false,
            summary: "test stage with variants",
            check: check_stage::<Echo>,
            build: build_stage::<Echo>,
        },
    ];
    static REGISTRY: Registry = Registry::new(&ENTRIES);

    fn parse(text: &str) -> Result<Pipeline> {
        Pipeline::parse(text, &REGISTRY)
    }

    #[test]
    fn parses_chain_with_variants_and_whitespace() {
        let p = parse(" swap1 -> copy ->swap8").unwrap();
        let names: Vec<_> = p.stages().iter().map(|d| (d.name, d.variant)).collect();
        assert_eq!(names, vec![("swap", Some(1)), ("copy", None), ("swap", Some(8))]);
        assert_eq!(p.to_string(), "swap1->copy->swap8");
        assert_eq!(p.build().unwrap().len(), 3);
    }

    #[test]
    fn arguments_are_parsed_and_canonicalised() {
        let p = parse("copy( level = 4 )").unwrap();
        assert_eq!(p.stages()[0].args.get("level").map(String::as_str), Some("4"));
        assert_eq!(p.to_string(), "copy(level=4)");
        assert_eq!(parse(&p.to_string()).unwrap(), p);
    }

    #[test]
    fn rejects_unknown_and_malformed_names() {
        for bad in [
            "", "   ", "foo", "foo->bar", "copy->", "->copy", "copy->->copy", "swap", "swap3",
            "swap01", "copy7", "1swap", "co-py", "copy(level=4", "copy(depth=2)",
            "copy(level=2,level=3)", "copy(level)", "copy(level=10)", "copy(level=x)",
        ] {
            let err = parse(bad).unwrap_err();
            assert!(
                matches!(err, SqyError::InvalidPipelineName { .. }),
                "{bad:?} gave {err:?}"
            );
            assert!(!Pipeline::is_possible(bad, &REGISTRY), "{bad:?}");
        }
    }

    #[test]
    fn equivalent_argument_spellings_share_one_name() {
        let canonical = parse("copy(level=3)").unwrap();
        for spelling in ["copy(level=03)", "copy(level=+3)", "copy(level=003)", "copy( level = 3 )"] {
            let p = parse(spelling).unwrap();
            assert_eq!(p, canonical, "{spelling:?}");
            assert_eq!(p.to_string(), "copy(level=3)");
        }
        assert_eq!(canonical_value("0.50"), "0.5");
        assert_eq!(canonical_value("-0"), "0");
        assert_eq!(canonical_value("1.0"), "1");
        assert_eq!(canonical_value("fast"), "fast");
        assert_eq!(canonical_value("1e3"), "1e3");
    }

    #[test]
    fn names_too_long_for_a_header_are_rejected() {
        // every segment is short, the chain is not
        let fits = vec!["copy(level=1)"; 200].join(STAGE_SEPARATOR);
        assert!(parse(&fits).is_ok());
        let padded = parse(&format!("copy(level={}1)", "0".repeat(400))).unwrap();
        assert_eq!(padded.to_string(), "copy(level=1)");

        let huge = format!("copy(tag={})", "x".repeat(MAX_PIPELINE_LEN));
        let err = parse(&huge).unwrap_err();
        assert!(matches!(err, SqyError::InvalidPipelineName { .. }), "{err:?}");
    }

    #[test]
    fn equality_follows_descriptors() {
        assert_eq!(parse("swap1->copy").unwrap(), parse("swap1 ->  copy").unwrap());
        assert_ne!(parse("swap1->copy").unwrap(), parse("swap2->copy").unwrap());
        assert_ne!(parse("copy").unwrap(), parse("copy(level=1)").unwrap());
    }
}
