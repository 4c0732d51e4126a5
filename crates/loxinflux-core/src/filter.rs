// ── Record filtering ──
//
// Stateless keep/drop decisions. Type rules run first and are coarse;
// identifier rules run after them and are fine-grained. Both apply.

use std::collections::HashSet;

use loxinflux_api::Provenance;

use crate::model::{Device, Resolved};

/// Allow/deny sets for one record source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterRules {
    pub type_allow: HashSet<String>,
    pub type_deny: HashSet<String>,
    pub id_allow: HashSet<String>,
    pub id_deny: HashSet<String>,
}

impl FilterRules {
    /// Build from raw lists; types are upper-cased.
    pub fn new<I, S>(type_allow: I, type_deny: I, id_allow: I, id_deny: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            type_allow: upper(type_allow),
            type_deny: upper(type_deny),
            id_allow: id_allow.into_iter().map(Into::into).collect(),
            id_deny: id_deny.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.type_allow.is_empty()
            && self.type_deny.is_empty()
            && self.id_allow.is_empty()
            && self.id_deny.is_empty()
    }
}

fn upper<I, S>(items: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items
        .into_iter()
        .map(|s| s.into().to_uppercase())
        .collect()
}

/// Why a record was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum DropReason {
    GlobalTypeDeny,
    TypeNotAllowed,
    TypeDenied,
    IdNotAllowed,
    IdDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Keep,
    Drop(DropReason),
}

impl Decision {
    pub fn is_keep(self) -> bool {
        self == Self::Keep
    }
}

/// Global type-deny set plus per-source rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterRuleSet {
    pub global_type_deny: HashSet<String>,
    pub push: FilterRules,
    pub poll: FilterRules,
}

impl FilterRuleSet {
    pub fn new<I, S>(global_type_deny: I, push: FilterRules, poll: FilterRules) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            global_type_deny: upper(global_type_deny),
            push,
            poll,
        }
    }

    pub fn rules_for(&self, source: Provenance) -> &FilterRules {
        match source {
            Provenance::Push => &self.push,
            Provenance::Poll => &self.poll,
        }
    }

    /// Decide whether a resolved record is forwarded. The first matching
    /// rule wins. Identifier rules match either the record's own
    /// identifier or, for sub-fields, the parent device's.
    pub fn evaluate(&self, resolved: &Resolved<'_>, source: Provenance) -> Decision {
        self.evaluate_ids(resolved.device, resolved.record_uuid(), source)
    }

    /// Poll-side check for a whole device before it is requested.
    pub fn allows_poll(&self, device: &Device) -> bool {
        self.evaluate_ids(device, &device.uuid, Provenance::Poll)
            .is_keep()
    }

    fn evaluate_ids(&self, device: &Device, record_uuid: &str, source: Provenance) -> Decision {
        let kind = device.kind.as_str();
        let rules = self.rules_for(source);
        let listed =
            |set: &HashSet<String>| set.contains(record_uuid) || set.contains(&device.uuid);

        if self.global_type_deny.contains(kind) {
            Decision::Drop(DropReason::GlobalTypeDeny)
        } else if !rules.type_allow.is_empty() && !rules.type_allow.contains(kind) {
            Decision::Drop(DropReason::TypeNotAllowed)
        } else if rules.type_deny.contains(kind) {
            Decision::Drop(DropReason::TypeDenied)
        } else if !rules.id_allow.is_empty() && !listed(&rules.id_allow) {
            Decision::Drop(DropReason::IdNotAllowed)
        } else if listed(&rules.id_deny) {
            Decision::Drop(DropReason::IdDenied)
        } else {
            Decision::Keep
        }
    }
}
