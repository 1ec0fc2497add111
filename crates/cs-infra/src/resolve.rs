use std::sync::LazyLock;

use cloudstack_api::ListTemplatesParams;
use regex::Regex;
use tracing::debug;

use crate::platform::Platform;
use crate::{Error, Result};

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("identifier pattern is valid")
});

/// Whether `s` is an opaque CloudStack ID (canonical 8-4-4-4-12 hex UUID)
/// rather than a symbolic name.
pub fn is_identifier(s: &str) -> bool {
    IDENTIFIER.is_match(s)
}

/// Opaque IDs for the placement resources named in the provider config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedIdentifiers {
    pub zone_id: String,
    pub service_offering_id: String,
    pub template_id: String,
    pub project_id: Option<String>,
}

/// Kinds of resource that may be referenced by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Zone,
    ServiceOffering,
    Project,
    Template,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zone => "zone",
            Self::ServiceOffering => "service_offering",
            Self::Project => "project",
            Self::Template => "template",
        }
    }
}

/// Already-resolved IDs that narrow a by-name lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct LookupScope<'a> {
    pub zone_id: Option<&'a str>,
    pub project_id: Option<&'a str>,
}

/// Resolve `value` to an opaque ID.
///
/// Identifiers are returned untouched without a remote call. Names are looked
/// up by kind; templates are scoped to `scope`. Zone and offering searches are
/// keyword matches, so only records whose name equals `value` count. Zones,
/// offerings and templates take the first match in API order; a project name
/// must match exactly one project.
pub async fn resolve(
    platform: &dyn Platform,
    kind: ResourceKind,
    value: &str,
    scope: LookupScope<'_>,
) -> Result<String> {
    if is_identifier(value) {
        return Ok(value.to_string());
    }

    debug!(kind = kind.as_str(), name = value, "resolving name to id");

    let ids: Vec<String> = match kind {
        ResourceKind::Zone => platform
            .list_zones(value)
            .await?
            .into_iter()
            .filter(|z| z.name == value)
            .map(|z| z.id)
            .collect(),
        ResourceKind::ServiceOffering => platform
            .list_service_offerings(value)
            .await?
            .into_iter()
            .filter(|o| o.name == value)
            .map(|o| o.id)
            .collect(),
        ResourceKind::Project => platform
            .list_projects(value)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect(),
        ResourceKind::Template => {
            let mut query = ListTemplatesParams::executable(value);
            query.zone_id = scope.zone_id.map(str::to_string);
            query.project_id = scope.project_id.map(str::to_string);
            platform
                .list_templates(&query)
                .await?
                .into_iter()
                .map(|t| t.id)
                .collect()
        }
    };

    match (kind, ids.as_slice()) {
        (_, []) => Err(Error::NotFound(format!("{} {value:?}", kind.as_str()))),
        (_, [only]) => Ok(only.clone()),
        (ResourceKind::Project, many) => Err(Error::Ambiguous(format!(
            "{} {} resources named {value:?}",
            many.len(),
            kind.as_str()
        ))),
        (_, [first, ..]) => {
            debug!(
                kind = kind.as_str(),
                name = value,
                matches = ids.len(),
                id = %first,
                "multiple matches, using first"
            );
            Ok(first.clone())
        }
    }
}
