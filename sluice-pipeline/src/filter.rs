//! Selection and pruning of data points by glob patterns.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, ConfigurationErrorKind, FilterError};
use crate::point::DataPoint;

/// Filter settings shared by all plugin instances.
///
/// All lists hold glob patterns supporting `*`, `?` and character classes. Empty lists do not
/// restrict anything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Only points whose name matches one of these patterns are selected.
    pub namepass: Vec<String>,
    /// Points whose name matches one of these patterns are not selected.
    pub namedrop: Vec<String>,
    /// Only points with a tag matching one of the patterns for its key are selected.
    pub tagpass: BTreeMap<String, Vec<String>>,
    /// Points with a tag matching one of the patterns for its key are not selected.
    pub tagdrop: BTreeMap<String, Vec<String>>,
    /// Fields to keep on selected points.
    pub fieldinclude: Vec<String>,
    /// Fields to remove from selected points.
    pub fielddrop: Vec<String>,
    /// Tags to keep on selected points.
    pub taginclude: Vec<String>,
    /// Tags to remove from selected points.
    pub tagexclude: Vec<String>,
}

impl FilterConfig {
    /// Returns `true` if no pattern is configured.
    pub fn is_empty(&self) -> bool {
        self.namepass.is_empty()
            && self.namedrop.is_empty()
            && self.tagpass.is_empty()
            && self.tagdrop.is_empty()
            && self.fieldinclude.is_empty()
            && self.fielddrop.is_empty()
            && self.taginclude.is_empty()
            && self.tagexclude.is_empty()
    }

    fn check_contradictions(&self) -> Result<(), ConfigurationErrorKind> {
        check_pair(&self.namepass, &self.namedrop, "namepass", "namedrop")?;
        check_pair(&self.fieldinclude, &self.fielddrop, "fieldinclude", "fielddrop")?;
        check_pair(&self.taginclude, &self.tagexclude, "taginclude", "tagexclude")?;

        for (key, pass) in &self.tagpass {
            if let Some(drop) = self.tagdrop.get(key) {
                check_pair(pass, drop, "tagpass", "tagdrop")?;
            }
        }

        Ok(())
    }
}

fn check_pair(
    include: &[String],
    exclude: &[String],
    include_name: &'static str,
    exclude_name: &'static str,
) -> Result<(), ConfigurationErrorKind> {
    match include.iter().find(|pattern| exclude.contains(pattern)) {
        Some(pattern) => Err(ConfigurationErrorKind::Contradictory {
            pattern: pattern.clone(),
            include: include_name,
            exclude: exclude_name,
        }),
        None => Ok(()),
    }
}

fn compile(patterns: &[String]) -> Result<Vec<GlobMatcher>, FilterError> {
    patterns
        .iter()
        .map(|pattern| {
            GlobBuilder::new(pattern)
                .build()
                .map(|glob| glob.compile_matcher())
                .map_err(|error| FilterError {
                    pattern: pattern.clone(),
                    message: error.kind().to_string(),
                })
        })
        .collect()
}

/// A compiled include/exclude pair of glob patterns.
///
/// A value matches if it matches any include pattern, or the include list is empty, and matches
/// no exclude pattern. Plugins use this for their own option lists, such as the fields a processor
/// should touch.
#[derive(Clone, Debug, Default)]
pub struct IncludeExclude {
    include: Vec<GlobMatcher>,
    exclude: Vec<GlobMatcher>,
}

impl IncludeExclude {
    /// Compiles the given pattern lists.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, FilterError> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Returns `true` if neither list has patterns.
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Returns `true` if the value passes both lists.
    pub fn matches(&self, value: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|glob| glob.is_match(value));
        included && !self.exclude.iter().any(|glob| glob.is_match(value))
    }
}

#[derive(Clone, Debug)]
struct CompiledFilter {
    names: IncludeExclude,
    tagpass: Vec<(String, Vec<GlobMatcher>)>,
    tagdrop: Vec<(String, Vec<GlobMatcher>)>,
    fields: IncludeExclude,
    tags: IncludeExclude,
}

impl CompiledFilter {
    fn compile(config: &FilterConfig) -> Result<Self, FilterError> {
        let compile_tags = |tags: &BTreeMap<String, Vec<String>>| {
            tags.iter()
                .map(|(key, patterns)| Ok((key.clone(), compile(patterns)?)))
                .collect::<Result<Vec<_>, FilterError>>()
        };

        Ok(Self {
            names: IncludeExclude::new(&config.namepass, &config.namedrop)?,
            tagpass: compile_tags(&config.tagpass)?,
            tagdrop: compile_tags(&config.tagdrop)?,
            fields: IncludeExclude::new(&config.fieldinclude, &config.fielddrop)?,
            tags: IncludeExclude::new(&config.taginclude, &config.tagexclude)?,
        })
    }
}

fn any_tag_matches(filters: &[(String, Vec<GlobMatcher>)], point: &DataPoint) -> bool {
    filters.iter().any(|(key, globs)| {
        point
            .tags
            .get(key)
            .is_some_and(|value| globs.iter().any(|glob| glob.is_match(value)))
    })
}

/// Compiled filter of a plugin instance.
///
/// A filter is immutable once constructed and can be shared by reference between any number of
/// concurrent callers.
#[derive(Clone, Default)]
pub struct Filter {
    config: FilterConfig,
    compiled: OnceLock<Result<CompiledFilter, FilterError>>,
}

impl Filter {
    /// Compiles a filter, rejecting malformed and contradictory patterns.
    pub fn new(config: FilterConfig) -> Result<Self, ConfigurationError> {
        config.check_contradictions()?;

        let compiled = CompiledFilter::compile(&config).map_err(ConfigurationErrorKind::from)?;
        Ok(Self {
            config,
            compiled: OnceLock::from(Ok(compiled)),
        })
    }

    /// Creates a filter that compiles its patterns on first use.
    ///
    /// Malformed patterns surface as [`FilterError`] from [`select`](Self::select) and
    /// [`modify`](Self::modify).
    pub fn lazy(config: FilterConfig) -> Self {
        Self {
            config,
            compiled: OnceLock::new(),
        }
    }

    /// Returns `true` if this filter neither restricts nor modifies points.
    pub fn is_empty(&self) -> bool {
        self.config.is_empty()
    }

    /// Returns the configuration this filter was built from.
    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    fn compiled(&self) -> Result<&CompiledFilter, FilterError> {
        self.compiled
            .get_or_init(|| CompiledFilter::compile(&self.config))
            .as_ref()
            .map_err(Clone::clone)
    }

    /// Decides whether a point is selected by name and tags.
    pub fn select(&self, point: &DataPoint) -> Result<bool, FilterError> {
        if self.is_empty() {
            return Ok(true);
        }

        let compiled = self.compiled()?;

        if !compiled.names.matches(&point.name) {
            return Ok(false);
        }

        if !compiled.tagpass.is_empty() && !any_tag_matches(&compiled.tagpass, point) {
            return Ok(false);
        }

        if any_tag_matches(&compiled.tagdrop, point) {
            return Ok(false);
        }

        Ok(true)
    }

    /// Removes fields and tags according to the include and exclude lists.
    pub fn modify(&self, point: &mut DataPoint) -> Result<(), FilterError> {
        if self.is_empty() {
            return Ok(());
        }

        let compiled = self.compiled()?;

        if !compiled.fields.is_empty() {
            point.fields.retain(|key, _| compiled.fields.matches(key));
        }

        if !compiled.tags.is_empty() {
            point.tags.retain(|key, _| compiled.tags.matches(key));
        }

        Ok(())
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.config.fmt(f)
    }
}
