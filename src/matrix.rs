//! Matrix expansion: axis definitions in, concrete job specs out.
//!
//! A matrix is an ordered list of [`AxisDefinition`]s. Expansion takes the
//! cartesian product of every axis, outer axis first and values in declared
//! order, so the same configuration always yields the same job list in the
//! same order. Combinations matching an [`ExcludeRule`] are dropped before
//! indices are assigned.
//!
//! ```text
//!   timezone = [UTC, Europe/Amsterdam]        #0 timezone=UTC,profile=default
//!   profile  = [default, spark-3.5]     ──►   #1 timezone=UTC,profile=spark-3.5
//!                                             #2 timezone=Europe/Amsterdam,profile=default
//!                                             #3 timezone=Europe/Amsterdam,profile=spark-3.5
//! ```
//!
//! # Well-known axes
//!
//! | Axis | Meaning |
//! |------|---------|
//! | `timezone` | Passed to the environment provisioner for the job |
//! | `profile` | Build profile handed to the test runner; `default` means none |
//!
//! Any other axis is free-form and only reaches the job through its
//! `MATRIX_<NAME>` environment variable.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Axis carrying the job's timezone.
pub const TIMEZONE_AXIS: &str = "timezone";

/// Axis carrying the job's build profile.
pub const PROFILE_AXIS: &str = "profile";

/// Profile value that selects the runner's default command.
pub const DEFAULT_PROFILE: &str = "default";

static AXIS_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("axis name pattern is valid")
});

/// Errors in the matrix or run configuration.
///
/// These are the only errors that abort a whole run, and they are always
/// raised before any job is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    /// The matrix declares no axes at all.
    #[error("matrix has no axes")]
    EmptyMatrix,

    /// An axis declares no values.
    #[error("axis '{0}' has no values")]
    EmptyAxis(String),

    /// Two axes share a name.
    #[error("axis '{0}' is declared more than once")]
    DuplicateAxis(String),

    /// An axis name is not a valid identifier.
    #[error("invalid axis name '{0}'")]
    InvalidAxisName(String),

    /// An axis contains an empty string value.
    #[error("axis '{axis}' contains an empty value")]
    EmptyValue { axis: String },

    /// An axis lists the same value twice.
    #[error("axis '{axis}' lists value '{value}' more than once")]
    DuplicateValue { axis: String, value: String },

    /// An exclude rule has no entries.
    #[error("exclude rule #{0} is empty")]
    EmptyExclude(usize),

    /// An exclude rule names an axis the matrix does not have.
    #[error("exclude rule #{rule} references unknown axis '{axis}'")]
    UnknownExcludeAxis { rule: usize, axis: String },

    /// An exclude rule names a value its axis does not have.
    #[error("exclude rule #{rule} references unknown value '{value}' for axis '{axis}'")]
    UnknownExcludeValue {
        rule: usize,
        axis: String,
        value: String,
    },

    /// Exclusions removed every combination.
    #[error("exclude rules remove every job from the matrix")]
    AllExcluded,

    /// Any other invalid setting.
    #[error("invalid setting '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigurationError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A named dimension of variation with its ordered values.
///
/// # Example
///
/// ```toml
/// [[axis]]
/// name = "timezone"
/// values = ["UTC", "Europe/Amsterdam"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AxisDefinition {
    /// Axis name, unique within the matrix.
    pub name: String,

    /// Values in the order jobs should be expanded.
    pub values: Vec<String>,
}

impl AxisDefinition {
    /// Creates an axis from a name and its values.
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Axis-to-value pairs identifying combinations to drop.
///
/// A combination is excluded when it matches every pair of the rule.
pub type ExcludeRule = BTreeMap<String, String>;

/// One axis value within a [`JobSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct AxisValue {
    pub axis: String,
    pub value: String,
}

/// One concrete combination of axis values.
///
/// Job specs are produced by [`expand`] and never change afterwards. The
/// [`id`](Self::id) is stable across runs for the same configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct JobSpec {
    index: usize,
    id: String,
    values: Vec<AxisValue>,
}

impl JobSpec {
    fn new(index: usize, values: Vec<AxisValue>) -> Self {
        let id = values
            .iter()
            .map(|v| format!("{}={}", v.axis, v.value))
            .collect::<Vec<_>>()
            .join(",");
        Self { index, id, values }
    }

    /// Position in the expanded matrix.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Stable identifier, e.g. `timezone=UTC,profile=default`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Axis values in axis order.
    pub fn values(&self) -> &[AxisValue] {
        &self.values
    }

    /// Value of the named axis, if the matrix has it.
    pub fn value(&self, axis: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|v| v.axis == axis)
            .map(|v| v.value.as_str())
    }

    /// The job's timezone, if the matrix has a `timezone` axis.
    pub fn timezone(&self) -> Option<&str> {
        self.value(TIMEZONE_AXIS)
    }

    /// The job's build profile; `None` for the default profile.
    pub fn profile(&self) -> Option<&str> {
        self.value(PROFILE_AXIS)
            .filter(|p| *p != DEFAULT_PROFILE && !p.is_empty())
    }

    /// Filesystem-safe form of the id, for log files and temp dirs.
    pub fn slug(&self) -> String {
        let slug: String = self
            .id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        format!("{:03}-{}", self.index, slug)
    }

    /// `MATRIX_<AXIS>` variables describing this job to the runner.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|v| {
                let name = v.axis.to_ascii_uppercase().replace('-', "_");
                (format!("MATRIX_{}", name), v.value.clone())
            })
            .collect()
    }

    fn matches(&self, rule: &ExcludeRule) -> bool {
        rule.iter()
            .all(|(axis, value)| self.value(axis) == Some(value.as_str()))
    }
}

impl fmt::Display for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Checks axis invariants without expanding.
pub fn validate_axes(axes: &[AxisDefinition]) -> Result<(), ConfigurationError> {
    if axes.is_empty() {
        return Err(ConfigurationError::EmptyMatrix);
    }

    let mut names = HashSet::new();
    for axis in axes {
        if !AXIS_NAME.is_match(&axis.name) {
            return Err(ConfigurationError::InvalidAxisName(axis.name.clone()));
        }
        if !names.insert(axis.name.as_str()) {
            return Err(ConfigurationError::DuplicateAxis(axis.name.clone()));
        }
        if axis.values.is_empty() {
            return Err(ConfigurationError::EmptyAxis(axis.name.clone()));
        }

        let mut seen = HashSet::new();
        for value in &axis.values {
            if value.is_empty() {
                return Err(ConfigurationError::EmptyValue {
                    axis: axis.name.clone(),
                });
            }
            if !seen.insert(value.as_str()) {
                return Err(ConfigurationError::DuplicateValue {
                    axis: axis.name.clone(),
                    value: value.clone(),
                });
            }
        }
    }

    Ok(())
}

fn validate_excludes(
    axes: &[AxisDefinition],
    exclude: &[ExcludeRule],
) -> Result<(), ConfigurationError> {
    for (rule_idx, rule) in exclude.iter().enumerate() {
        if rule.is_empty() {
            return Err(ConfigurationError::EmptyExclude(rule_idx));
        }
        for (axis_name, value) in rule {
            let axis = axes.iter().find(|a| &a.name == axis_name).ok_or_else(|| {
                ConfigurationError::UnknownExcludeAxis {
                    rule: rule_idx,
                    axis: axis_name.clone(),
                }
            })?;
            if !axis.values.contains(value) {
                return Err(ConfigurationError::UnknownExcludeValue {
                    rule: rule_idx,
                    axis: axis_name.clone(),
                    value: value.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Expands axes into job specs.
///
/// Order is axis order outer-to-inner with values in declared order.
/// Combinations matching any exclude rule are removed, then indices are
/// assigned so they stay contiguous.
///
/// # Errors
///
/// Returns [`ConfigurationError`] if the axes are malformed, an exclude
/// rule does not refer to the matrix, or nothing is left after exclusion.
///
/// # Example
///
/// ```
/// use jobmatrix::matrix::{expand, AxisDefinition};
///
/// let jobs = expand(
///     &[
///         AxisDefinition::new("timezone", ["UTC", "Europe/Amsterdam"]),
///         AxisDefinition::new("profile", ["default"]),
///     ],
///     &[],
/// )?;
///
/// assert_eq!(jobs.len(), 2);
/// assert_eq!(jobs[0].id(), "timezone=UTC,profile=default");
/// # Ok::<(), jobmatrix::matrix::ConfigurationError>(())
/// ```
pub fn expand(
    axes: &[AxisDefinition],
    exclude: &[ExcludeRule],
) -> Result<Vec<JobSpec>, ConfigurationError> {
    validate_axes(axes)?;
    validate_excludes(axes, exclude)?;

    let mut combinations: Vec<Vec<AxisValue>> = vec![Vec::new()];
    for axis in axes {
        combinations = combinations
            .into_iter()
            .flat_map(|prefix| {
                axis.values.iter().map(move |value| {
                    let mut combination = prefix.clone();
                    combination.push(AxisValue {
                        axis: axis.name.clone(),
                        value: value.clone(),
                    });
                    combination
                })
            })
            .collect();
    }

    let jobs: Vec<JobSpec> = combinations
        .into_iter()
        .map(|values| JobSpec::new(0, values))
        .filter(|job| !exclude.iter().any(|rule| job.matches(rule)))
        .enumerate()
        .map(|(index, job)| JobSpec { index, ..job })
        .collect();

    if jobs.is_empty() {
        return Err(ConfigurationError::AllExcluded);
    }

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tz_profile() -> Vec<AxisDefinition> {
        vec![
            AxisDefinition::new("timezone", ["UTC", "Europe/Amsterdam"]),
            AxisDefinition::new("profile", ["default", "spark-3.5"]),
        ]
    }

    #[test]
    fn test_expand_two_by_one() {
        let jobs = expand(
            &[
                AxisDefinition::new("timezone", ["UTC", "Europe/Amsterdam"]),
                AxisDefinition::new("profile", ["default"]),
            ],
            &[],
        )
        .unwrap();

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].timezone(), Some("UTC"));
        assert_eq!(jobs[1].timezone(), Some("Europe/Amsterdam"));
    }

    #[test]
    fn test_expand_order_is_outer_to_inner() {
        let jobs = expand(&tz_profile(), &[]).unwrap();
        let ids: Vec<_> = jobs.iter().map(|j| j.id().to_string()).collect();

        assert_eq!(
            ids,
            vec![
                "timezone=UTC,profile=default",
                "timezone=UTC,profile=spark-3.5",
                "timezone=Europe/Amsterdam,profile=default",
                "timezone=Europe/Amsterdam,profile=spark-3.5",
            ]
        );
        for (i, job) in jobs.iter().enumerate() {
            assert_eq!(job.index(), i);
        }
    }

    #[test]
    fn test_expand_is_product_of_cardinalities() {
        let axes = vec![
            AxisDefinition::new("a", ["1", "2", "3"]),
            AxisDefinition::new("b", ["x", "y"]),
            AxisDefinition::new("c", ["p", "q", "r", "s"]),
        ];
        let jobs = expand(&axes, &[]).unwrap();
        assert_eq!(jobs.len(), 24);

        // Re-deriving gives the same sequence
        assert_eq!(jobs, expand(&axes, &[]).unwrap());
    }

    #[test]
    fn test_expand_rejects_empty_axis() {
        let err = expand(&[AxisDefinition::new("timezone", Vec::<String>::new())], &[])
            .unwrap_err();
        assert_eq!(err, ConfigurationError::EmptyAxis("timezone".to_string()));
    }

    #[test]
    fn test_expand_rejects_duplicate_axis() {
        let err = expand(
            &[
                AxisDefinition::new("timezone", ["UTC"]),
                AxisDefinition::new("timezone", ["Europe/Amsterdam"]),
            ],
            &[],
        )
        .unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateAxis("timezone".to_string()));
    }

    #[test]
    fn test_expand_rejects_no_axes() {
        assert_eq!(expand(&[], &[]).unwrap_err(), ConfigurationError::EmptyMatrix);
    }

    #[test]
    fn test_expand_rejects_bad_axis_name() {
        let err = expand(&[AxisDefinition::new("time zone", ["UTC"])], &[]).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidAxisName(_)));
    }

    #[test]
    fn test_expand_rejects_duplicate_value() {
        let err = expand(&[AxisDefinition::new("timezone", ["UTC", "UTC"])], &[]).unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateValue { .. }));
    }

    #[test]
    fn test_exclude_drops_matching_cell_and_reindexes() {
        let rule: ExcludeRule = [
            ("timezone".to_string(), "Europe/Amsterdam".to_string()),
            ("profile".to_string(), "spark-3.5".to_string()),
        ]
        .into_iter()
        .collect();

        let jobs = expand(&tz_profile(), &[rule]).unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[2].id(), "timezone=Europe/Amsterdam,profile=default");
        assert_eq!(jobs[2].index(), 2);
    }

    #[test]
    fn test_exclude_unknown_axis() {
        let rule: ExcludeRule = [("os".to_string(), "linux".to_string())]
            .into_iter()
            .collect();
        let err = expand(&tz_profile(), &[rule]).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownExcludeAxis { .. }));
    }

    #[test]
    fn test_exclude_unknown_value() {
        let rule: ExcludeRule = [("timezone".to_string(), "Asia/Tokyo".to_string())]
            .into_iter()
            .collect();
        let err = expand(&tz_profile(), &[rule]).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownExcludeValue { .. }));
    }

    #[test]
    fn test_exclude_everything() {
        let rule: ExcludeRule = [("profile".to_string(), "default".to_string())]
            .into_iter()
            .collect();
        let err = expand(&[AxisDefinition::new("profile", ["default"])], &[rule]).unwrap_err();
        assert_eq!(err, ConfigurationError::AllExcluded);
    }

    #[test]
    fn test_default_profile_is_none() {
        let jobs = expand(&tz_profile(), &[]).unwrap();
        assert_eq!(jobs[0].profile(), None);
        assert_eq!(jobs[1].profile(), Some("spark-3.5"));
    }

    #[test]
    fn test_env_vars_and_slug() {
        let jobs = expand(
            &[
                AxisDefinition::new("timezone", ["Europe/Amsterdam"]),
                AxisDefinition::new("jdk-vendor", ["temurin"]),
            ],
            &[],
        )
        .unwrap();

        let env = jobs[0].env_vars();
        assert_eq!(
            env,
            vec![
                ("MATRIX_TIMEZONE".to_string(), "Europe/Amsterdam".to_string()),
                ("MATRIX_JDK_VENDOR".to_string(), "temurin".to_string()),
            ]
        );
        assert_eq!(
            jobs[0].slug(),
            "000-timezone_Europe_Amsterdam_jdk-vendor_temurin"
        );
    }
}
