use thiserror::Error;

/// Errors raised by the physics layer.
#[derive(Error, Debug)]
pub enum HothamError {
    /// The physics world's engine instance has been shut down.
    #[error("The physics engine is unavailable - the world was probably shut down")]
    EngineUnavailable,
    /// A collider description could not be turned into a usable collision primitive.
    #[error("Unable to create collision shape: {reason}")]
    InvalidShape {
        /// What was wrong with the description
        reason: String,
    },
    /// A joint description could not be turned into an engine joint.
    #[error("Unable to create joint: {reason}")]
    InvalidJoint {
        /// What was wrong with the description
        reason: String,
    },
    /// An operation would break the shape composition of a body.
    #[error("Invalid structural change: {reason}")]
    StructuralMisuse {
        /// What was attempted
        reason: String,
    },
    /// Begin/end update brackets on an aggregate were misused.
    #[error("Aggregate update bracket misuse: {reason}")]
    UpdateBracket {
        /// What was attempted
        reason: String,
    },
    /// The referenced rigid body does not exist.
    #[error("No rigid body exists for this id")]
    UnknownBody,
    /// The referenced engine handle is stale or was never issued.
    #[error("The engine handle is invalid")]
    InvalidHandle,
    /// A required component was missing from an entity.
    #[error(transparent)]
    Component(#[from] hecs::ComponentError),
    /// The entity does not exist.
    #[error(transparent)]
    NoSuchEntity(#[from] hecs::NoSuchEntity),
    #[error(transparent)]
    /// An IO error.
    IO(#[from] std::io::Error),
    /// A (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HothamError {
    pub(crate) fn invalid_shape(reason: impl Into<String>) -> Self {
        HothamError::InvalidShape {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_joint(reason: impl Into<String>) -> Self {
        HothamError::InvalidJoint {
            reason: reason.into(),
        }
    }

    pub(crate) fn structural(reason: impl Into<String>) -> Self {
        HothamError::StructuralMisuse {
            reason: reason.into(),
        }
    }

    pub(crate) fn bracket(reason: impl Into<String>) -> Self {
        HothamError::UpdateBracket {
            reason: reason.into(),
        }
    }
}
