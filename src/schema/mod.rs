//! Entity types and their field schemas
//!
//! Each entity type declares the fields it accepts and the synchronous rules
//! a value must pass before it is sent (client) or applied (server).

pub mod relations;
pub mod validation;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use relations::{relation_spec, RelationSpec};
pub use validation::{normalize_values, validate_entity, validate_field, ValidationError};

/// Typed intelligence object kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Campaign,
    IntrusionSet,
    ThreatActor,
    Report,
    Organization,
    Country,
    Sector,
    Tool,
    AttackPattern,
    CourseOfAction,
    Indicator,
    MarkingDefinition,
    KillChainPhase,
    User,
    Group,
    Role,
    Capability,
    Settings,
}

impl EntityType {
    pub const ALL: [EntityType; 18] = [
        EntityType::Campaign,
        EntityType::IntrusionSet,
        EntityType::ThreatActor,
        EntityType::Report,
        EntityType::Organization,
        EntityType::Country,
        EntityType::Sector,
        EntityType::Tool,
        EntityType::AttackPattern,
        EntityType::CourseOfAction,
        EntityType::Indicator,
        EntityType::MarkingDefinition,
        EntityType::KillChainPhase,
        EntityType::User,
        EntityType::Group,
        EntityType::Role,
        EntityType::Capability,
        EntityType::Settings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Campaign => "Campaign",
            EntityType::IntrusionSet => "IntrusionSet",
            EntityType::ThreatActor => "ThreatActor",
            EntityType::Report => "Report",
            EntityType::Organization => "Organization",
            EntityType::Country => "Country",
            EntityType::Sector => "Sector",
            EntityType::Tool => "Tool",
            EntityType::AttackPattern => "AttackPattern",
            EntityType::CourseOfAction => "CourseOfAction",
            EntityType::Indicator => "Indicator",
            EntityType::MarkingDefinition => "MarkingDefinition",
            EntityType::KillChainPhase => "KillChainPhase",
            EntityType::User => "User",
            EntityType::Group => "Group",
            EntityType::Role => "Role",
            EntityType::Capability => "Capability",
            EntityType::Settings => "Settings",
        }
    }

    /// Prefix of generated natural ids, e.g. `intrusion-set` in
    /// `intrusion-set--<uuid>`
    pub fn natural_id_prefix(&self) -> String {
        let mut out = String::new();
        for (i, ch) in self.as_str().chars().enumerate() {
            if ch.is_ascii_uppercase() {
                if i > 0 {
                    out.push('-');
                }
                out.push(ch.to_ascii_lowercase());
            } else {
                out.push(ch);
            }
        }
        out
    }

    /// Knowledge entities are gated by `KNOWLEDGE*`, the rest by `SETTINGS*`
    pub fn is_knowledge(&self) -> bool {
        !matches!(
            self,
            EntityType::MarkingDefinition
                | EntityType::KillChainPhase
                | EntityType::User
                | EntityType::Group
                | EntityType::Role
                | EntityType::Capability
                | EntityType::Settings
        )
    }

    pub fn schema(&self) -> &'static EntitySchema {
        schema_for(*self)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    /// Accepts `IntrusionSet`, `intrusion-set`, `intrusion_set`, `intrusionset`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();

        EntityType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().to_ascii_lowercase() == wanted)
            .ok_or_else(|| format!("Unknown entity type: {}", s))
    }
}

/// A single synchronous rule on a field value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    Required,
    MinLength(usize),
    MaxLength(usize),
    Number,
    Integer,
    Email,
    OneOf(&'static [&'static str]),
    Boolean,
    /// RFC 3339 timestamp
    DateTime,
}

/// One field of an entity schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    /// List field (aliases, labels) rather than a scalar
    pub multiple: bool,
    pub rules: &'static [FieldRule],
}

impl FieldSpec {
    pub fn is_required(&self) -> bool {
        self.rules.contains(&FieldRule::Required)
    }
}

/// Field schema of an entity type
#[derive(Debug)]
pub struct EntitySchema {
    pub entity_type: EntityType,
    pub fields: &'static [FieldSpec],
}

impl EntitySchema {
    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &'static FieldSpec> {
        self.fields.iter().filter(|f| f.is_required())
    }
}

const fn scalar(name: &'static str, rules: &'static [FieldRule]) -> FieldSpec {
    FieldSpec {
        name,
        multiple: false,
        rules,
    }
}

const fn list(name: &'static str, rules: &'static [FieldRule]) -> FieldSpec {
    FieldSpec {
        name,
        multiple: true,
        rules,
    }
}

const SOPHISTICATION: &[&str] = &[
    "none",
    "minimal",
    "intermediate",
    "advanced",
    "expert",
    "innovator",
    "strategic",
];

const RESOURCE_LEVEL: &[&str] = &[
    "individual",
    "club",
    "contest",
    "team",
    "organization",
    "government",
];

const REPORT_CLASS: &[&str] = &["Threat Report", "Internal Report", "External Report"];

const LANGUAGES: &[&str] = &["auto", "en", "fr"];

const NAME: FieldSpec = scalar("name", &[FieldRule::Required]);
const DESCRIPTION: FieldSpec = scalar("description", &[]);
const ALIAS: FieldSpec = list("alias", &[]);
const FIRST_SEEN: FieldSpec = scalar("first_seen", &[FieldRule::DateTime]);
const LAST_SEEN: FieldSpec = scalar("last_seen", &[FieldRule::DateTime]);

static CAMPAIGN: EntitySchema = EntitySchema {
    entity_type: EntityType::Campaign,
    fields: &[
        NAME,
        DESCRIPTION,
        ALIAS,
        scalar("objective", &[]),
        FIRST_SEEN,
        LAST_SEEN,
    ],
};

static INTRUSION_SET: EntitySchema = EntitySchema {
    entity_type: EntityType::IntrusionSet,
    fields: &[
        NAME,
        DESCRIPTION,
        ALIAS,
        scalar("goal", &[]),
        scalar("sophistication", &[FieldRule::OneOf(SOPHISTICATION)]),
        scalar("resource_level", &[FieldRule::OneOf(RESOURCE_LEVEL)]),
        scalar("primary_motivation", &[]),
        scalar("secondary_motivation", &[]),
        FIRST_SEEN,
        LAST_SEEN,
    ],
};

static THREAT_ACTOR: EntitySchema = EntitySchema {
    entity_type: EntityType::ThreatActor,
    fields: &[
        NAME,
        DESCRIPTION,
        ALIAS,
        scalar("goal", &[]),
        scalar("sophistication", &[FieldRule::OneOf(SOPHISTICATION)]),
        scalar("resource_level", &[FieldRule::OneOf(RESOURCE_LEVEL)]),
        scalar("primary_motivation", &[]),
        scalar("secondary_motivation", &[]),
        scalar("personal_motivation", &[]),
        FIRST_SEEN,
        LAST_SEEN,
    ],
};

static REPORT: EntitySchema = EntitySchema {
    entity_type: EntityType::Report,
    fields: &[
        NAME,
        DESCRIPTION,
        scalar("published", &[FieldRule::Required, FieldRule::DateTime]),
        scalar("report_class", &[FieldRule::OneOf(REPORT_CLASS)]),
        scalar("object_status", &[FieldRule::Integer]),
        scalar("source_confidence_level", &[FieldRule::Integer]),
        scalar("graph_data", &[]),
    ],
};

static ORGANIZATION: EntitySchema = EntitySchema {
    entity_type: EntityType::Organization,
    fields: &[
        NAME,
        DESCRIPTION,
        ALIAS,
        scalar("organization_class", &[]),
        scalar("reliability", &[]),
    ],
};

static COUNTRY: EntitySchema = EntitySchema {
    entity_type: EntityType::Country,
    fields: &[
        NAME,
        scalar(
            "description",
            &[
                FieldRule::Required,
                FieldRule::MinLength(3),
                FieldRule::MaxLength(5000),
            ],
        ),
        ALIAS,
    ],
};

static SECTOR: EntitySchema = EntitySchema {
    entity_type: EntityType::Sector,
    fields: &[NAME, DESCRIPTION, ALIAS],
};

static TOOL: EntitySchema = EntitySchema {
    entity_type: EntityType::Tool,
    fields: &[
        NAME,
        DESCRIPTION,
        ALIAS,
        scalar("tool_version", &[]),
    ],
};

static ATTACK_PATTERN: EntitySchema = EntitySchema {
    entity_type: EntityType::AttackPattern,
    fields: &[
        NAME,
        DESCRIPTION,
        ALIAS,
        scalar("external_id", &[]),
        list("platform", &[]),
        list("required_permission", &[]),
    ],
};

static COURSE_OF_ACTION: EntitySchema = EntitySchema {
    entity_type: EntityType::CourseOfAction,
    fields: &[NAME, DESCRIPTION, ALIAS],
};

static INDICATOR: EntitySchema = EntitySchema {
    entity_type: EntityType::Indicator,
    fields: &[
        NAME,
        DESCRIPTION,
        scalar("indicator_pattern", &[]),
        scalar("main_observable_type", &[]),
        scalar("valid_from", &[FieldRule::DateTime]),
        scalar("valid_until", &[FieldRule::DateTime]),
        scalar("score", &[FieldRule::Number]),
    ],
};

static MARKING_DEFINITION: EntitySchema = EntitySchema {
    entity_type: EntityType::MarkingDefinition,
    fields: &[
        scalar("definition_type", &[FieldRule::Required]),
        scalar("definition", &[FieldRule::Required]),
        scalar("color", &[FieldRule::Required]),
        scalar("level", &[FieldRule::Required, FieldRule::Integer]),
    ],
};

static KILL_CHAIN_PHASE: EntitySchema = EntitySchema {
    entity_type: EntityType::KillChainPhase,
    fields: &[
        scalar("kill_chain_name", &[FieldRule::Required]),
        scalar("phase_name", &[FieldRule::Required]),
        scalar("phase_order", &[FieldRule::Required, FieldRule::Integer]),
    ],
};

static USER: EntitySchema = EntitySchema {
    entity_type: EntityType::User,
    fields: &[
        NAME,
        scalar("user_email", &[FieldRule::Required, FieldRule::Email]),
        scalar("firstname", &[]),
        scalar("lastname", &[]),
        scalar("language", &[]),
        DESCRIPTION,
    ],
};

static GROUP: EntitySchema = EntitySchema {
    entity_type: EntityType::Group,
    fields: &[NAME, DESCRIPTION],
};

static ROLE: EntitySchema = EntitySchema {
    entity_type: EntityType::Role,
    fields: &[
        NAME,
        DESCRIPTION,
        scalar("default_assignation", &[FieldRule::Boolean]),
    ],
};

static CAPABILITY: EntitySchema = EntitySchema {
    entity_type: EntityType::Capability,
    fields: &[NAME, DESCRIPTION],
};

static SETTINGS: EntitySchema = EntitySchema {
    entity_type: EntityType::Settings,
    fields: &[
        scalar("platform_title", &[FieldRule::Required]),
        scalar("platform_email", &[FieldRule::Email]),
        scalar("platform_language", &[FieldRule::OneOf(LANGUAGES)]),
        scalar("platform_url", &[]),
    ],
};

/// Schema of an entity type
pub fn schema_for(entity_type: EntityType) -> &'static EntitySchema {
    match entity_type {
        EntityType::Campaign => &CAMPAIGN,
        EntityType::IntrusionSet => &INTRUSION_SET,
        EntityType::ThreatActor => &THREAT_ACTOR,
        EntityType::Report => &REPORT,
        EntityType::Organization => &ORGANIZATION,
        EntityType::Country => &COUNTRY,
        EntityType::Sector => &SECTOR,
        EntityType::Tool => &TOOL,
        EntityType::AttackPattern => &ATTACK_PATTERN,
        EntityType::CourseOfAction => &COURSE_OF_ACTION,
        EntityType::Indicator => &INDICATOR,
        EntityType::MarkingDefinition => &MARKING_DEFINITION,
        EntityType::KillChainPhase => &KILL_CHAIN_PHASE,
        EntityType::User => &USER,
        EntityType::Group => &GROUP,
        EntityType::Role => &ROLE,
        EntityType::Capability => &CAPABILITY,
        EntityType::Settings => &SETTINGS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entity_type_forms() {
        assert_eq!("IntrusionSet".parse::<EntityType>().unwrap(), EntityType::IntrusionSet);
        assert_eq!("intrusion-set".parse::<EntityType>().unwrap(), EntityType::IntrusionSet);
        assert_eq!("kill_chain_phase".parse::<EntityType>().unwrap(), EntityType::KillChainPhase);
        assert!("Malware".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_natural_id_prefix() {
        assert_eq!(EntityType::Campaign.natural_id_prefix(), "campaign");
        assert_eq!(EntityType::IntrusionSet.natural_id_prefix(), "intrusion-set");
        assert_eq!(EntityType::CourseOfAction.natural_id_prefix(), "course-of-action");
    }

    #[test]
    fn test_every_type_has_schema() {
        for t in EntityType::ALL {
            assert_eq!(t.schema().entity_type, t);
            assert!(t.schema().required_fields().count() > 0);
        }
    }

    #[test]
    fn test_kill_chain_phase_required_fields() {
        let names: Vec<_> = EntityType::KillChainPhase
            .schema()
            .required_fields()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["kill_chain_name", "phase_name", "phase_order"]);
    }

    #[test]
    fn test_serialized_as_pascal_case() {
        assert_eq!(
            serde_json::to_string(&EntityType::ThreatActor).unwrap(),
            "\"ThreatActor\""
        );
    }
}
