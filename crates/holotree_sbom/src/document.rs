//! Rendering collected components as CycloneDX 1.4 or SPDX 2.3 JSON.
//!
//! Key order is fixed by struct declaration order and components arrive
//! pre-sorted, so serialization is byte-stable for a given catalog.

use holotree::catalog::Catalog;
use serde::Serialize;
use uuid::Uuid;

use crate::{collect::Component, SbomError};

const TOOL_NAME: &str = "holotree";
const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CycloneDxDocument<'a> {
    bom_format: &'static str,
    spec_version: &'static str,
    serial_number: String,
    version: u32,
    metadata: CycloneDxMetadata,
    components: Vec<CycloneDxComponent<'a>>,
}

#[derive(Serialize)]
struct CycloneDxMetadata {
    timestamp: String,
    tools: Vec<CycloneDxTool>,
}

#[derive(Serialize)]
struct CycloneDxTool {
    vendor: &'static str,
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CycloneDxComponent<'a> {
    #[serde(rename = "type")]
    component_type: &'static str,
    name: &'a str,
    version: &'a str,
    purl: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    licenses: Vec<CycloneDxLicenseChoice<'a>>,
}

#[derive(Serialize)]
struct CycloneDxLicenseChoice<'a> {
    license: CycloneDxLicense<'a>,
}

#[derive(Serialize)]
struct CycloneDxLicense<'a> {
    name: &'a str,
}

/// Renders a CycloneDX 1.4 JSON document. The serial number is a version-5
/// UUID derived from the blueprint hash, so repeated generation for the
/// same blueprint yields byte-identical output.
pub fn cyclonedx_document(
    catalog: &Catalog,
    components: &[Component],
) -> Result<String, SbomError> {
    let serial = Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("holotree:{}", catalog.blueprint).as_bytes(),
    );
    let document = CycloneDxDocument {
        bom_format: "CycloneDX",
        spec_version: "1.4",
        serial_number: format!("urn:uuid:{serial}"),
        version: 1,
        metadata: CycloneDxMetadata {
            timestamp: catalog.recorded_at.to_rfc3339(),
            tools: vec![CycloneDxTool {
                vendor: "robocorp",
                name: TOOL_NAME,
                version: TOOL_VERSION,
            }],
        },
        components: components
            .iter()
            .map(|component| CycloneDxComponent {
                component_type: "library",
                name: &component.name,
                version: &component.version,
                purl: &component.purl,
                author: component.author.as_deref(),
                licenses: component
                    .license
                    .as_deref()
                    .map(|name| {
                        vec![CycloneDxLicenseChoice {
                            license: CycloneDxLicense { name },
                        }]
                    })
                    .unwrap_or_default(),
            })
            .collect(),
    };
    render(&document)
}

#[derive(Serialize)]
struct SpdxDocument<'a> {
    #[serde(rename = "spdxVersion")]
    spdx_version: &'static str,
    #[serde(rename = "dataLicense")]
    data_license: &'static str,
    #[serde(rename = "SPDXID")]
    spdx_id: &'static str,
    name: String,
    #[serde(rename = "documentNamespace")]
    document_namespace: String,
    #[serde(rename = "creationInfo")]
    creation_info: SpdxCreationInfo,
    packages: Vec<SpdxPackage<'a>>,
}

#[derive(Serialize)]
struct SpdxCreationInfo {
    created: String,
    creators: Vec<String>,
}

#[derive(Serialize)]
struct SpdxPackage<'a> {
    name: &'a str,
    #[serde(rename = "SPDXID")]
    spdx_id: String,
    #[serde(rename = "versionInfo")]
    version_info: &'a str,
    #[serde(rename = "downloadLocation")]
    download_location: &'static str,
    #[serde(rename = "licenseConcluded")]
    license_concluded: &'static str,
    #[serde(rename = "licenseDeclared")]
    license_declared: String,
    #[serde(rename = "externalRefs")]
    external_refs: Vec<SpdxExternalRef<'a>>,
    #[serde(rename = "homepage", skip_serializing_if = "Option::is_none")]
    homepage: Option<&'a str>,
}

#[derive(Serialize)]
struct SpdxExternalRef<'a> {
    #[serde(rename = "referenceCategory")]
    reference_category: &'static str,
    #[serde(rename = "referenceType")]
    reference_type: &'static str,
    #[serde(rename = "referenceLocator")]
    reference_locator: &'a str,
}

/// Renders an SPDX 2.3 JSON document.
pub fn spdx_document(catalog: &Catalog, components: &[Component]) -> Result<String, SbomError> {
    let hash = catalog.blueprint.to_string();
    let document = SpdxDocument {
        spdx_version: "SPDX-2.3",
        data_license: "CC0-1.0",
        spdx_id: "SPDXRef-DOCUMENT",
        name: format!("holotree-{}", &hash[..16]),
        document_namespace: format!("https://robocorp.com/spdx/holotree/{hash}"),
        creation_info: SpdxCreationInfo {
            created: catalog.recorded_at.to_rfc3339(),
            creators: vec![format!("Tool: {TOOL_NAME}-{TOOL_VERSION}")],
        },
        packages: components
            .iter()
            .enumerate()
            .map(|(index, component)| SpdxPackage {
                name: &component.name,
                spdx_id: format!("SPDXRef-Package-{index}"),
                version_info: &component.version,
                download_location: "NOASSERTION",
                license_concluded: "NOASSERTION",
                license_declared: component
                    .license
                    .clone()
                    .unwrap_or_else(|| "NOASSERTION".to_owned()),
                external_refs: vec![SpdxExternalRef {
                    reference_category: "PACKAGE-MANAGER",
                    reference_type: "purl",
                    reference_locator: &component.purl,
                }],
                homepage: component.homepage.as_deref(),
            })
            .collect(),
    };
    render(&document)
}

fn render<T: Serialize>(document: &T) -> Result<String, SbomError> {
    let mut text = serde_json::to_string_pretty(document).map_err(SbomError::Encode)?;
    text.push('\n');
    Ok(text)
}
