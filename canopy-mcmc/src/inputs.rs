//! Named construction slots and their validation rules.
//!
//! A component declares its slots as a static table; whoever wires the
//! model reports which slots it filled and [`check_slots`] enforces the
//! rules before the component is built.

use std::collections::BTreeSet;

use canopy_core::{CanopyError, Result};

/// When a slot must be filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Required,
    Optional,
    /// Exactly one of this slot and the named partner must be filled.
    Xor(&'static str),
}

/// One named construction parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub name: &'static str,
    pub rule: Rule,
    pub tip: &'static str,
}

impl Slot {
    pub const fn required(name: &'static str, tip: &'static str) -> Self {
        Self {
            name,
            rule: Rule::Required,
            tip,
        }
    }

    pub const fn optional(name: &'static str, tip: &'static str) -> Self {
        Self {
            name,
            rule: Rule::Optional,
            tip,
        }
    }

    pub const fn xor(name: &'static str, partner: &'static str, tip: &'static str) -> Self {
        Self {
            name,
            rule: Rule::Xor(partner),
            tip,
        }
    }
}

/// Check the filled slot names of `component` against its declared slots.
///
/// # Errors
///
/// Returns a model error naming the component for a slot filled twice, an
/// undeclared slot, a missing required slot, or an exclusive pair with
/// both or neither slot filled.
pub fn check_slots(component: &str, slots: &[Slot], filled: &[&str]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for &name in filled {
        if !seen.insert(name) {
            return Err(CanopyError::model(
                component,
                format!("input '{}' given more than once", name),
            ));
        }
        if !slots.iter().any(|s| s.name == name) {
            let known: Vec<&str> = slots.iter().map(|s| s.name).collect();
            return Err(CanopyError::model(
                component,
                format!("unknown input '{}'; expected one of {}", name, known.join(", ")),
            ));
        }
    }
    for slot in slots {
        let present = seen.contains(slot.name);
        match slot.rule {
            Rule::Optional => {}
            Rule::Required if !present => {
                return Err(CanopyError::model(
                    component,
                    format!("input '{}' is required ({})", slot.name, slot.tip),
                ));
            }
            Rule::Required => {}
            Rule::Xor(partner) => {
                if present == seen.contains(partner) {
                    let how = if present { "not both" } else { "one" };
                    return Err(CanopyError::model(
                        component,
                        format!("exactly one of '{}' and '{}' must be given, {}", slot.name, partner, how),
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLOTS: &[Slot] = &[
        Slot::xor("parameter", "tree", "real parameter to scale"),
        Slot::xor("tree", "parameter", "tree whose heights are scaled"),
        Slot::required("weight", "selection weight"),
        Slot::optional("scale_factor", "initial scale factor"),
    ];

    #[test]
    fn valid_combinations() {
        check_slots("scaler", SLOTS, &["parameter", "weight"]).unwrap();
        check_slots("scaler", SLOTS, &["weight", "tree", "scale_factor"]).unwrap();
    }

    #[test]
    fn missing_required() {
        let err = check_slots("scaler", SLOTS, &["tree"]).unwrap_err();
        assert!(err.to_string().contains("'weight' is required"));
        assert!(err.to_string().contains("scaler"));
    }

    #[test]
    fn exclusive_pair() {
        assert!(check_slots("scaler", SLOTS, &["weight"]).is_err());
        let both = check_slots("scaler", SLOTS, &["weight", "tree", "parameter"]).unwrap_err();
        assert!(both.to_string().contains("not both"));
    }

    #[test]
    fn unknown_and_repeated() {
        let unknown = check_slots("scaler", SLOTS, &["weight", "tree", "window"]).unwrap_err();
        assert!(unknown.to_string().contains("unknown input 'window'"));
        assert!(check_slots("scaler", SLOTS, &["weight", "tree", "tree"]).is_err());
    }
}
