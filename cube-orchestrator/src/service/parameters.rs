//! Parameter resolution for workflow nodes
//!
//! Each declared plugin parameter is resolved from, in order: the caller's
//! override for the node, the piping's default, the plugin's own default.
//! Every value is validated against the parameter's kind, and path values
//! against the user's permission scope and the storage backend.

use cube_core::domain::parameter::ParameterValue;
use cube_core::domain::pipeline::Piping;
use cube_core::domain::plugin::{Plugin, PluginParameter};
use cube_core::domain::plugin_instance::ParameterInstance;
use cube_core::dto::workflow::ParameterOverride;

use super::workflow::WorkflowError;
use crate::context::ServiceContext;

const FIELD: &str = "nodes_info";

/// Resolve the parameters of one node
pub async fn resolve(
    ctx: &ServiceContext,
    user: &str,
    plugin: &Plugin,
    piping: &Piping,
    overrides: &[ParameterOverride],
) -> Result<Vec<ParameterInstance>, WorkflowError> {
    let mut resolved = Vec::with_capacity(plugin.parameters.len());

    for param in &plugin.parameters {
        let Some(value) = resolve_value(param, piping, overrides)? else {
            continue;
        };
        if value.kind().is_path() {
            check_paths(ctx, user, piping, param, &value).await?;
        }
        resolved.push(ParameterInstance {
            plugin_param_id: param.id,
            name: param.name.clone(),
            value,
        });
    }

    Ok(resolved)
}

/// `None` for an optional parameter nobody gave a value
fn resolve_value(
    param: &PluginParameter,
    piping: &Piping,
    overrides: &[ParameterOverride],
) -> Result<Option<ParameterValue>, WorkflowError> {
    let given = overrides
        .iter()
        .find(|o| o.name == param.name && !o.default.is_null());
    if let Some(given) = given {
        return validate(param, piping, &given.default).map(Some);
    }

    let piping_default = piping.defaults.iter().find(|d| d.name == param.name);
    let value = match piping_default {
        Some(d) => d.value.clone(),
        None => param.default.clone(),
    };

    match value {
        // Stored defaults are re-checked in case the plugin schema changed
        Some(value) if value.kind() == param.kind => Ok(Some(value)),
        Some(value) => validate(param, piping, &value.to_json()).map(Some),
        None if piping_default.is_none() && param.optional => Ok(None),
        None => Err(WorkflowError::validation(
            FIELD,
            format!(
                "Can not run workflow. Parameter '{}' for piping with id {} does not have a default value in the pipeline",
                param.name, piping.id
            ),
        )),
    }
}

fn validate(
    param: &PluginParameter,
    piping: &Piping,
    raw: &serde_json::Value,
) -> Result<ParameterValue, WorkflowError> {
    param.kind.validate(raw).map_err(|e| {
        WorkflowError::validation(
            FIELD,
            format!(
                "Invalid parameter default value {} for parameter '{}' and piping with id {}: {}",
                raw, param.name, piping.id, e
            ),
        )
    })
}

async fn check_paths(
    ctx: &ServiceContext,
    user: &str,
    piping: &Piping,
    param: &PluginParameter,
    value: &ParameterValue,
) -> Result<(), WorkflowError> {
    for path in value.paths() {
        if !ctx.permissions.can_access(user, path).await {
            return Err(WorkflowError::validation(
                FIELD,
                format!(
                    "You do not have permission to access path {} given for parameter '{}' of piping with id {}",
                    path, param.name, piping.id
                ),
            ));
        }
        if !ctx.storage.path_exists(path).await? {
            return Err(WorkflowError::validation(
                FIELD,
                format!(
                    "Path {} given for parameter '{}' of piping with id {} does not exist",
                    path, param.name, piping.id
                ),
            ));
        }
    }
    Ok(())
}
