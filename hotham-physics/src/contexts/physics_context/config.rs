use std::collections::HashMap;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::HothamResult;

/// Surface properties of a collider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsMaterial {
    /// How "bouncy" is this surface?
    pub restitution: f32,
    /// Friction coefficient when at rest
    pub static_friction: f32,
    /// Friction coefficient when sliding
    pub kinetic_friction: f32,
}

impl Default for PhysicsMaterial {
    fn default() -> Self {
        Self {
            restitution: 0.4,
            static_friction: 0.8,
            kinetic_friction: 0.6,
        }
    }
}

/// How two materials behave when they touch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterialInteraction {
    /// The two material ids, in either order
    pub materials: [u32; 2],
    /// How "bouncy" is the contact?
    pub restitution: f32,
    /// Friction coefficient while the contact is at rest
    pub static_friction: f32,
    /// Friction coefficient while the contact is sliding
    pub kinetic_friction: f32,
    /// `false` lets the two materials pass straight through each other
    pub collision_enabled: bool,
}

impl Default for MaterialInteraction {
    fn default() -> Self {
        Self::between([0, 0], Default::default(), Default::default())
    }
}

impl MaterialInteraction {
    /// The interaction used for pairs with no explicit entry: each property is the average of the
    /// two materials, and they collide
    pub fn between(materials: [u32; 2], a: PhysicsMaterial, b: PhysicsMaterial) -> Self {
        Self {
            materials,
            restitution: (a.restitution + b.restitution) * 0.5,
            static_friction: (a.static_friction + b.static_friction) * 0.5,
            kinetic_friction: (a.kinetic_friction + b.kinetic_friction) * 0.5,
            collision_enabled: true,
        }
    }

    /// Does this entry describe the pair `a`, `b`?
    pub fn matches(&self, a: u32, b: u32) -> bool {
        self.materials == [a, b] || self.materials == [b, a]
    }
}

/// Settings for a [`super::PhysicsContext`]. Every field is optional when loading from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsConfig {
    /// Gravity applied to every dynamic body
    pub gravity: Vec3,
    /// Fixed timestep, in seconds
    pub timestep: f32,
    /// Solver iterations per step
    pub solver_iterations: usize,
    /// Material id 0, also used for ids missing from `materials`
    pub default_material: PhysicsMaterial,
    /// Further materials, keyed by id
    pub materials: HashMap<u32, PhysicsMaterial>,
    /// Overrides for particular pairs of materials
    pub material_interactions: Vec<MaterialInteraction>,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0., -9.81, 0.),
            // TODO: This is *usually* 72fps on the Quest 2, but we may support higher refresh rates later.
            timestep: 1. / 72.,
            solver_iterations: 4,
            default_material: Default::default(),
            materials: Default::default(),
            material_interactions: Default::default(),
        }
    }
}

impl PhysicsConfig {
    /// Parse a config from a JSON string
    pub fn from_json(json: &str) -> HothamResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Look up a material, falling back to the default
    pub fn material(&self, id: u32) -> PhysicsMaterial {
        if id == 0 {
            return self.default_material;
        }
        self.materials
            .get(&id)
            .copied()
            .unwrap_or(self.default_material)
    }

    /// How materials `a` and `b` behave when they touch
    pub fn interaction(&self, a: u32, b: u32) -> MaterialInteraction {
        self.material_interactions
            .iter()
            .rev()
            .find(|i| i.matches(a, b))
            .copied()
            .unwrap_or_else(|| MaterialInteraction::between([a, b], self.material(a), self.material(b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    pub fn test_defaults() {
        let config = PhysicsConfig::default();
        assert_relative_eq!(config.gravity, Vec3::new(0., -9.81, 0.));
        assert_relative_eq!(config.timestep, 1. / 72.);
        assert_relative_eq!(config.default_material.restitution, 0.4);
        assert_relative_eq!(config.default_material.static_friction, 0.8);
        assert_relative_eq!(config.default_material.kinetic_friction, 0.6);
    }

    #[test]
    pub fn test_from_json() {
        let config = PhysicsConfig::from_json(
            r#"{
                "gravity": [0.0, -1.62, 0.0],
                "materials": { "3": { "restitution": 0.9 } }
            }"#,
        )
        .unwrap();
        assert_relative_eq!(config.gravity.y, -1.62);
        assert_relative_eq!(config.timestep, 1. / 72.);

        let ice = config.material(3);
        assert_relative_eq!(ice.restitution, 0.9);
        assert_relative_eq!(ice.kinetic_friction, 0.6);

        // Unknown ids fall back to the default
        assert_eq!(config.material(42), config.default_material);
    }

    #[test]
    pub fn test_material_interactions() {
        let config = PhysicsConfig::from_json(
            r#"{
                "materials": { "1": { "kinetic_friction": 0.2 } },
                "material_interactions": [
                    { "materials": [1, 2], "static_friction": 0.1, "collision_enabled": false }
                ]
            }"#,
        )
        .unwrap();

        // Listed pairs work in either order
        let ghost = config.interaction(2, 1);
        assert!(!ghost.collision_enabled);
        assert_relative_eq!(ghost.static_friction, 0.1);
        assert_relative_eq!(ghost.restitution, 0.4);

        // Everything else averages the two materials
        let mixed = config.interaction(1, 0);
        assert!(mixed.collision_enabled);
        assert_relative_eq!(mixed.kinetic_friction, 0.4);
        assert_relative_eq!(mixed.static_friction, 0.8);
        assert_eq!(mixed.materials, [1, 0]);

        // Survives a trip back through JSON
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(PhysicsConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    pub fn test_bad_json() {
        assert!(matches!(
            PhysicsConfig::from_json("{ gravity"),
            Err(crate::HothamError::Json(_))
        ));
    }
}
