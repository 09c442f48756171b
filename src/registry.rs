//! (role, variant) -> protocol definition
use crate::error::ConfigurationError;
use crate::protocol::ProtocolDefinition;
use crate::protocols::{multisig, reputation};
use crate::trade::{ProtocolVariant, TradeRole};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Built once at startup. Lookups are pure; combinations without a table are
/// refused when a trade is created, never later.
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    definitions: BTreeMap<(TradeRole, ProtocolVariant), Arc<ProtocolDefinition>>,
    unimplemented: BTreeSet<(TradeRole, ProtocolVariant)>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in table.
    pub fn standard() -> Result<Self, ConfigurationError> {
        let mut registry = Self::new();
        for role in TradeRole::ALL {
            registry.register(reputation::definition(role)?)?;
        }
        registry.register(multisig::seller_as_maker()?)?;
        registry.register(multisig::buyer_as_taker()?)?;
        for role in multisig::UNIMPLEMENTED_ROLES {
            registry.declare_unimplemented(role, ProtocolVariant::MultisigEscrow);
        }
        Ok(registry)
    }

    pub fn register(&mut self, definition: ProtocolDefinition) -> Result<(), ConfigurationError> {
        let key = (definition.role(), definition.variant());
        if self.definitions.contains_key(&key) {
            return Err(ConfigurationError::DuplicateRegistration {
                role: key.0,
                variant: key.1,
            });
        }
        self.unimplemented.remove(&key);
        self.definitions.insert(key, Arc::new(definition));
        Ok(())
    }

    /// Records a combination that exists in the product but has no table yet.
    pub fn declare_unimplemented(&mut self, role: TradeRole, variant: ProtocolVariant) {
        if !self.definitions.contains_key(&(role, variant)) {
            self.unimplemented.insert((role, variant));
        }
    }

    pub fn lookup(
        &self,
        role: TradeRole,
        variant: ProtocolVariant,
    ) -> Result<Arc<ProtocolDefinition>, ConfigurationError> {
        match self.definitions.get(&(role, variant)) {
            Some(definition) => Ok(Arc::clone(definition)),
            None => {
                if self.is_unimplemented(role, variant) {
                    tracing::debug!(%role, %variant, "protocol combination is not implemented");
                }
                Err(ConfigurationError::UnsupportedCombination { role, variant })
            }
        }
    }

    pub fn is_unimplemented(&self, role: TradeRole, variant: ProtocolVariant) -> bool {
        self.unimplemented.contains(&(role, variant))
    }

    pub fn supported(&self) -> impl Iterator<Item = (TradeRole, ProtocolVariant)> + '_ {
        self.definitions.keys().copied()
    }
}
