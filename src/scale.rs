use std::time::Duration;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Volume};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{AttachParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use log::{debug, info};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;

use crate::errors::*;

/// Upper bound on the in-pod disk usage probe; well under a reconcile cycle.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

const BINARY_SUFFIXES: &[(&str, u64)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL_SUFFIXES: &[(&str, u64)] = &[
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
];

/// Parse a storage quantity (`10Gi`, `500M`, plain bytes) into bytes.
pub fn parse_quantity(quantity: &str) -> Result<u64> {
    let raw = quantity.trim();
    let malformed = || Error::from(ErrorKind::MalformedQuantity(raw.to_string()));

    let parse_value = |value: &str, factor: u64| -> Result<u64> {
        if let Ok(n) = value.parse::<u64>() {
            return Ok(n.saturating_mul(factor));
        }
        let f: f64 = value.parse().map_err(|_| malformed())?;
        if f < 0.0 {
            return Err(malformed());
        }
        Ok((f * factor as f64) as u64)
    };

    for (suffix, factor) in BINARY_SUFFIXES {
        if let Some(value) = raw.strip_suffix(suffix) {
            return parse_value(value, *factor);
        }
    }
    for (suffix, factor) in DECIMAL_SUFFIXES {
        if let Some(value) = raw.strip_suffix(suffix) {
            return parse_value(value, *factor);
        }
    }
    parse_value(raw, 1)
}

/// Render bytes with the largest binary suffix that divides evenly.
pub fn format_quantity(bytes: u64) -> String {
    for (suffix, factor) in BINARY_SUFFIXES.iter().rev() {
        if bytes >= *factor && bytes % factor == 0 {
            return format!("{}{}", bytes / factor, suffix);
        }
    }
    bytes.to_string()
}

/// Parse `du -BK` output, e.g. `9000000K`, into bytes.
pub fn parse_du_kibibytes(raw: &str) -> Result<u64> {
    let trimmed = raw.trim();
    let blocks: u64 = trimmed
        .trim_end_matches('K')
        .parse()
        .map_err(|_| Error::from(ErrorKind::MalformedQuantity(trimmed.to_string())))?;
    Ok(blocks.saturating_mul(1024))
}

/// Integer percentage of the request in use, truncated.
pub fn used_percent(used_bytes: u64, requested_bytes: u64) -> i64 {
    if requested_bytes == 0 {
        return 0;
    }
    ((used_bytes as f64 / requested_bytes as f64) * 100.0) as i64
}

pub fn storage_request(claim: &PersistentVolumeClaim) -> Option<&Quantity> {
    claim
        .spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
}

fn requested_bytes(claim: &PersistentVolumeClaim) -> u64 {
    storage_request(claim)
        .and_then(|quantity| parse_quantity(&quantity.0).ok())
        .unwrap_or(0)
}

/// Pick the claim with the largest storage request; ties keep the first in
/// list order so the choice is deterministic.
pub fn largest_claim(claims: Vec<PersistentVolumeClaim>) -> Option<PersistentVolumeClaim> {
    let mut best: Option<(u64, PersistentVolumeClaim)> = None;
    for claim in claims {
        let bytes = requested_bytes(&claim);
        match &best {
            Some((top, _)) if *top >= bytes => {}
            _ => best = Some((bytes, claim)),
        }
    }
    best.map(|(_, claim)| claim)
}

/// First persistent-volume-claim volume in the pod spec, with its index.
pub fn claim_volume(pod: &Pod) -> Option<(usize, &Volume)> {
    pod.spec
        .as_ref()?
        .volumes
        .as_ref()?
        .iter()
        .enumerate()
        .find(|(_, volume)| volume.persistent_volume_claim.is_some())
}

/// Run `du` inside the pod's first container and report used bytes for the
/// given mount path.
pub async fn probe_used_bytes(client: Client, pod: &Pod, mount_path: &str) -> Result<u64> {
    let namespace = pod.namespace().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(client, &namespace);
    let command = format!("du -hs -BK {} | awk '{{print $1}}'", mount_path);

    let mut attached = timeout(
        PROBE_TIMEOUT,
        pods.exec(
            &pod.name_any(),
            vec!["sh", "-c", command.as_str()],
            &AttachParams::default().stderr(false),
        ),
    )
    .await
    .map_err(|_| Error::from("disk usage probe timed out"))??;

    let mut output = String::new();
    if let Some(mut stdout) = attached.stdout() {
        timeout(PROBE_TIMEOUT, stdout.read_to_string(&mut output))
            .await
            .map_err(|_| Error::from("disk usage probe timed out"))??;
    }
    attached
        .join()
        .await
        .map_err(|e| Error::from(e.to_string()))?;

    parse_du_kibibytes(&output)
}

/// Attempt in-place expansion of the claim to `new_bytes`. Returns false
/// when the backing storage class declines (no expansion support, or the
/// driver rejects the resize), which selects the copy-job path instead.
pub async fn expand_in_place(
    client: Client,
    claim: &PersistentVolumeClaim,
    new_bytes: u64,
) -> Result<bool> {
    let class_name = match claim
        .spec
        .as_ref()
        .and_then(|spec| spec.storage_class_name.clone())
    {
        Some(name) => name,
        None => return Ok(false),
    };

    let classes: Api<StorageClass> = Api::all(client.clone());
    let allows = classes
        .get_opt(&class_name)
        .await?
        .and_then(|class| class.allow_volume_expansion)
        .unwrap_or(false);
    if !allows {
        debug!("storage class {} does not allow volume expansion", class_name);
        return Ok(false);
    }

    let namespace = claim.namespace().unwrap_or_default();
    let claims: Api<PersistentVolumeClaim> = Api::namespaced(client, &namespace);
    let patch = json!({
        "spec": {"resources": {"requests": {"storage": format_quantity(new_bytes)}}}
    });
    match claims
        .patch(&claim.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => {
            info!(
                "expanded claim {} in place to {}",
                claim.name_any(),
                format_quantity(new_bytes)
            );
            Ok(true)
        }
        Err(kube::Error::Api(ae)) if ae.code == 403 || ae.code == 422 => {
            debug!("driver declined expansion of claim {}: {}", claim.name_any(), ae.message);
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}
