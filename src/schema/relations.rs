//! Known relation names
//!
//! A relation is stored on its `from` entity and projected there under a
//! label (`object_marking_refs` shows up as `markingDefinitions`).

use super::EntityType;

/// Which entity types may start a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FromTypes {
    AnyKnowledge,
    Only(&'static [EntityType]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationSpec {
    pub through: &'static str,
    pub from: FromTypes,
    pub to: EntityType,
    pub label: &'static str,
}

impl RelationSpec {
    pub fn accepts(&self, from: EntityType, to: EntityType) -> bool {
        let from_ok = match self.from {
            FromTypes::AnyKnowledge => from.is_knowledge(),
            FromTypes::Only(types) => types.contains(&from),
        };
        from_ok && to == self.to
    }
}

pub const RELATIONS: &[RelationSpec] = &[
    RelationSpec {
        through: "object_marking_refs",
        from: FromTypes::AnyKnowledge,
        to: EntityType::MarkingDefinition,
        label: "markingDefinitions",
    },
    RelationSpec {
        through: "kill_chain_phases",
        from: FromTypes::Only(&[EntityType::AttackPattern, EntityType::Indicator, EntityType::Tool]),
        to: EntityType::KillChainPhase,
        label: "killChainPhases",
    },
    RelationSpec {
        through: "mitigates",
        from: FromTypes::Only(&[EntityType::CourseOfAction]),
        to: EntityType::AttackPattern,
        label: "attackPatterns",
    },
    RelationSpec {
        through: "user_role",
        from: FromTypes::Only(&[EntityType::User]),
        to: EntityType::Role,
        label: "roles",
    },
    RelationSpec {
        through: "role_capability",
        from: FromTypes::Only(&[EntityType::Role]),
        to: EntityType::Capability,
        label: "capabilities",
    },
    RelationSpec {
        through: "permission",
        from: FromTypes::Only(&[EntityType::Group]),
        to: EntityType::MarkingDefinition,
        label: "permissions",
    },
    RelationSpec {
        through: "membership",
        from: FromTypes::Only(&[EntityType::User]),
        to: EntityType::Group,
        label: "groups",
    },
    RelationSpec {
        through: "located_at",
        from: FromTypes::Only(&[EntityType::Organization]),
        to: EntityType::Country,
        label: "countries",
    },
];

pub fn relation_spec(through: &str) -> Option<&'static RelationSpec> {
    RELATIONS.iter().find(|r| r.through == through)
}
