use thiserror::Error;

/// Errors surfaced by the conversion engine.
///
/// Unsupported resource shapes never error — the pass skips them and leaves
/// the resource untouched. An error means the input claimed a feature the
/// engine supports but specified it in a contradictory or mistyped way.
#[derive(Debug, Error)]
pub enum SamaraError {
    /// Contradictory or mistyped input on a supported feature, reported with
    /// the offending property and resource so the user can fix the template.
    #[error("resource '{resource}': property '{property}' is invalid. {message}")]
    Validation {
        resource: String,
        property: String,
        message: String,
    },

    /// The injected asset stager failed while materializing a code asset.
    #[error("staging asset for '{logical_id}' failed.\n{source}")]
    Staging {
        logical_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl SamaraError {
    pub(crate) fn validation(
        resource: impl Into<String>,
        property: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        SamaraError::Validation {
            resource: resource.into(),
            property: property.into(),
            message: message.into(),
        }
    }

    pub(crate) fn staging(logical_id: impl Into<String>, source: anyhow::Error) -> Self {
        SamaraError::Staging {
            logical_id: logical_id.into(),
            source,
        }
    }
}
