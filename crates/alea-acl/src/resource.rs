//! Resource naming
//!
//! Protected resources are addressed by path-like ids such as
//! `/course/ai-1/instance/WS24/quiz`. Callers usually name them through a
//! [`ResourceName`] template plus variables, which also fixes the set of
//! [`Action`]s that make sense for the resource.
//!
//! Access-control entries may be bound to wildcard ids (`/course/**`), which
//! [`ResourcePattern`] matches against concrete ids.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::AclError;

/// Operations that can be protected on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    AccessControl,
    Mutate,
    Moderate,
    Preview,
    Read,
    Take,
    Apply,
    InstructorGrading,
    CreateJobPost,
    CreateJobType,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::AccessControl => "ACCESS_CONTROL",
            Action::Mutate => "MUTATE",
            Action::Moderate => "MODERATE",
            Action::Preview => "PREVIEW",
            Action::Read => "READ",
            Action::Take => "TAKE",
            Action::Apply => "APPLY",
            Action::InstructorGrading => "INSTRUCTOR_GRADING",
            Action::CreateJobPost => "CREATE_JOB_POST",
            Action::CreateJobType => "CREATE_JOB_TYPE",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = AclError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCESS_CONTROL" => Ok(Action::AccessControl),
            "MUTATE" => Ok(Action::Mutate),
            "MODERATE" => Ok(Action::Moderate),
            "PREVIEW" => Ok(Action::Preview),
            "READ" => Ok(Action::Read),
            "TAKE" => Ok(Action::Take),
            "APPLY" => Ok(Action::Apply),
            "INSTRUCTOR_GRADING" => Ok(Action::InstructorGrading),
            "CREATE_JOB_POST" => Ok(Action::CreateJobPost),
            "CREATE_JOB_TYPE" => Ok(Action::CreateJobType),
            _ => Err(AclError::InvalidResource(format!("Unknown action: {}", s))),
        }
    }
}

/// Known resource templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceName {
    SysAdmin,
    AllComments,
    AllStudyBuddy,
    CourseNotes,
    CourseQuiz,
    CourseHomework,
    CourseComments,
    CourseStudyBuddy,
    CourseAccess,
    CourseProblemReview,
    JobPortal,
    JobPortalOrg,
}

impl ResourceName {
    /// Id template; `{name}` segments are filled from variables
    pub fn template(&self) -> &'static str {
        match self {
            ResourceName::SysAdmin => "/sys-admin",
            ResourceName::AllComments => "/comments",
            ResourceName::AllStudyBuddy => "/study-buddy",
            ResourceName::CourseNotes => "/course/{courseId}/instance/{instanceId}/notes",
            ResourceName::CourseQuiz => "/course/{courseId}/instance/{instanceId}/quiz",
            ResourceName::CourseHomework => "/course/{courseId}/instance/{instanceId}/homework",
            ResourceName::CourseComments => "/course/{courseId}/instance/{instanceId}/comments",
            ResourceName::CourseStudyBuddy => {
                "/course/{courseId}/instance/{instanceId}/study-buddy"
            }
            ResourceName::CourseAccess => {
                "/course/{courseId}/instance/{instanceId}/access-control"
            }
            ResourceName::CourseProblemReview => {
                "/course/{courseId}/instance/{instanceId}/problem-review"
            }
            ResourceName::JobPortal => "/job-portal",
            ResourceName::JobPortalOrg => "/job-portal/org/{orgId}",
        }
    }

    /// Actions that may be bound to or checked against this resource
    pub fn valid_actions(&self) -> &'static [Action] {
        match self {
            ResourceName::SysAdmin => &[Action::AccessControl, Action::Mutate],
            ResourceName::AllComments | ResourceName::AllStudyBuddy => &[Action::Moderate],
            ResourceName::CourseNotes => &[Action::Mutate, Action::Preview],
            ResourceName::CourseQuiz => &[Action::Mutate, Action::Preview, Action::Take],
            ResourceName::CourseHomework => {
                &[Action::Mutate, Action::InstructorGrading, Action::Take]
            }
            ResourceName::CourseComments | ResourceName::CourseStudyBuddy => &[Action::Moderate],
            ResourceName::CourseAccess => &[Action::AccessControl],
            ResourceName::CourseProblemReview => &[Action::Read, Action::Mutate],
            ResourceName::JobPortal => &[Action::Apply, Action::CreateJobType],
            ResourceName::JobPortalOrg => &[Action::CreateJobPost, Action::Read],
        }
    }

    pub fn is_valid_action(&self, action: Action) -> bool {
        self.valid_actions().contains(&action)
    }

    /// Fill the template with `variables`
    ///
    /// Every placeholder must be supplied, and a value may not contain `/`.
    pub fn resource_id(&self, variables: &HashMap<String, String>) -> Result<String, AclError> {
        let mut segments = Vec::new();
        for segment in self.template().split('/') {
            match segment
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
            {
                Some(var) => {
                    let value = variables.get(var).ok_or_else(|| {
                        AclError::InvalidResource(format!(
                            "Missing variable '{}' for {}",
                            var,
                            self.template()
                        ))
                    })?;
                    if value.is_empty() || value.contains('/') {
                        return Err(AclError::InvalidResource(format!(
                            "Invalid value '{}' for variable '{}'",
                            value, var
                        )));
                    }
                    segments.push(value.as_str());
                }
                None => segments.push(segment),
            }
        }
        Ok(segments.join("/"))
    }
}

/// One templated (resource, action) to check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceActionParams {
    pub name: ResourceName,
    pub action: Action,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl ResourceActionParams {
    pub fn new(name: ResourceName, action: Action) -> Self {
        Self {
            name,
            action,
            variables: HashMap::new(),
        }
    }

    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Validate the action and resolve the concrete resource id
    pub fn resolve(&self) -> Result<String, AclError> {
        if !self.name.is_valid_action(self.action) {
            return Err(AclError::InvalidAction {
                action: self.action.to_string(),
                resource: self.name.template().to_string(),
            });
        }
        self.name.resource_id(&self.variables)
    }
}

/// Wildcard resource id
///
/// `/**` matches zero or more trailing segments, `/*` exactly one segment.
/// Everything else matches literally.
#[derive(Debug, Clone)]
pub struct ResourcePattern {
    pattern: String,
    regex: Regex,
}

impl ResourcePattern {
    pub fn new(pattern: &str) -> Result<Self, AclError> {
        let mut expr = String::from("^");
        let mut rest = pattern;
        while !rest.is_empty() {
            if let Some(tail) = rest.strip_prefix("/**") {
                expr.push_str("(/.*)?");
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix("/*") {
                expr.push_str("/[^/]+");
                rest = tail;
            } else {
                let skip = rest.chars().next().map_or(0, char::len_utf8);
                let next = rest[skip..]
                    .find('/')
                    .map(|i| i + skip)
                    .unwrap_or(rest.len());
                expr.push_str(&regex::escape(&rest[..next]));
                rest = &rest[next..];
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| {
            AclError::InvalidResource(format!("Invalid pattern '{}': {}", pattern, e))
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, resource_id: &str) -> bool {
        self.regex.is_match(resource_id)
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}
