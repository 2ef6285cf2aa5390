//! ACL data model
//!
//! The persisted entities are [`AccessControlList`], [`AclMembership`] and
//! [`ResourceAction`]. A membership edge points either at a nested ACL or at
//! a single user; [`Member`] keeps that choice explicit so an edge can never
//! carry both or neither.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::AclError;

/// A named permission group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlList {
    pub id: String,
    pub description: String,
    /// Open ACLs expose their membership to anyone and accept self-joins
    pub is_open: bool,
    /// Members of this ACL may change this ACL's definition
    #[serde(rename = "updaterACLId")]
    pub updater_acl_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Definition of a new ACL, optionally with its initial members
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAcl {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_open: bool,
    #[serde(rename = "updaterACLId")]
    pub updater_acl_id: String,
    #[serde(default, rename = "memberACLIds")]
    pub member_acl_ids: Vec<String>,
    #[serde(default)]
    pub member_user_ids: Vec<String>,
}

impl NewAcl {
    /// Create an empty ACL definition governed by `updater_acl_id`
    pub fn new(id: impl Into<String>, updater_acl_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            updater_acl_id: updater_acl_id.into(),
            ..Default::default()
        }
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the ACL as open
    pub fn open(mut self) -> Self {
        self.is_open = true;
        self
    }

    /// Add an initial user member
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.member_user_ids.push(user_id.into());
        self
    }

    /// Add an initial nested ACL
    pub fn with_acl(mut self, acl_id: impl Into<String>) -> Self {
        self.member_acl_ids.push(acl_id.into());
        self
    }

    /// Initial members as tagged edges
    pub fn members(&self) -> impl Iterator<Item = Member> + '_ {
        self.member_acl_ids
            .iter()
            .cloned()
            .map(Member::Acl)
            .chain(self.member_user_ids.iter().cloned().map(Member::User))
    }
}

/// Changes to an ACL's definition. Membership is edited through edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclUpdate {
    pub description: Option<String>,
    pub is_open: Option<bool>,
    #[serde(rename = "updaterACLId")]
    pub updater_acl_id: Option<String>,
}

/// The member side of a membership edge
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Member {
    /// A nested ACL; its members are members of the parent
    Acl(String),
    /// A single user granted membership directly
    User(String),
}

impl Member {
    /// Build a member from the two nullable storage columns
    pub fn from_columns(
        member_acl_id: Option<String>,
        member_user_id: Option<String>,
    ) -> Result<Self, AclError> {
        match (member_acl_id, member_user_id) {
            (Some(acl), None) => Ok(Member::Acl(acl)),
            (None, Some(user)) => Ok(Member::User(user)),
            (Some(acl), Some(user)) => Err(AclError::InvalidMembership(format!(
                "both member ACL '{}' and member user '{}' are set",
                acl, user
            ))),
            (None, None) => Err(AclError::InvalidMembership(
                "neither member ACL nor member user is set".to_string(),
            )),
        }
    }

    /// Split into the two storage columns
    pub fn as_columns(&self) -> (Option<&str>, Option<&str>) {
        match self {
            Member::Acl(id) => (Some(id.as_str()), None),
            Member::User(id) => (None, Some(id.as_str())),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Member::Acl(id) | Member::User(id) => id,
        }
    }

    pub fn is_acl(&self) -> bool {
        matches!(self, Member::Acl(_))
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Acl(id) => write!(f, "acl:{}", id),
            Member::User(id) => write!(f, "user:{}", id),
        }
    }
}

/// A directed membership edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclMembership {
    pub id: i64,
    #[serde(rename = "parentACLId")]
    pub parent_acl_id: String,
    pub member: Member,
}

impl fmt::Display for AclMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.parent_acl_id, self.member)
    }
}

/// Binding of a protected (resource, action) pair to its governing ACL
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAction {
    pub resource_id: String,
    pub action_id: String,
    pub acl_id: String,
}

impl ResourceAction {
    pub fn new(
        resource_id: impl Into<String>,
        action_id: impl Into<String>,
        acl_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            action_id: action_id.into(),
            acl_id: acl_id.into(),
        }
    }
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.resource_id, self.action_id, self.acl_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_from_columns() {
        assert_eq!(
            Member::from_columns(Some("b".into()), None).unwrap(),
            Member::Acl("b".into())
        );
        assert_eq!(
            Member::from_columns(None, Some("u1".into())).unwrap(),
            Member::User("u1".into())
        );
        assert!(matches!(
            Member::from_columns(Some("b".into()), Some("u1".into())),
            Err(AclError::InvalidMembership(_))
        ));
        assert!(matches!(
            Member::from_columns(None, None),
            Err(AclError::InvalidMembership(_))
        ));
    }

    #[test]
    fn test_member_columns_round_trip() {
        let member = Member::User("u1".into());
        let (acl, user) = member.as_columns();
        assert_eq!((acl, user), (None, Some("u1")));
        assert_eq!(
            Member::from_columns(acl.map(String::from), user.map(String::from)).unwrap(),
            member
        );
    }

    #[test]
    fn test_member_display() {
        assert_eq!(Member::Acl("moderators".into()).to_string(), "acl:moderators");
        assert_eq!(Member::User("alice".into()).to_string(), "user:alice");
    }

    #[test]
    fn test_new_acl_deserialize() {
        let acl: NewAcl = serde_json::from_str(
            r#"{
                "id": "ai-1-WS24-tutors",
                "description": "tutors",
                "updaterACLId": "ai-1-WS24-instructors",
                "memberUserIds": ["alice"],
                "memberACLIds": ["ai-1-WS24-instructors"]
            }"#,
        )
        .unwrap();
        assert!(!acl.is_open);
        let members: Vec<_> = acl.members().collect();
        assert_eq!(
            members,
            vec![
                Member::Acl("ai-1-WS24-instructors".into()),
                Member::User("alice".into())
            ]
        );
    }
}
