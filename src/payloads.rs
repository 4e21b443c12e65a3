use log::{info, warn};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::contact::Contact;
use crate::errors::{AgentError, Result};

/// Fetches and writes every named payload, returning the local paths that
/// were successfully staged. Failures are logged and skipped; the batch
/// never aborts.
pub async fn stage_payloads(
    contact: &Arc<dyn Contact>,
    profile: &Value,
    payloads: &[String],
) -> Vec<String> {
    let mut staged = Vec::new();
    for payload in payloads {
        match write_payload_to_disk(contact, profile, payload).await {
            Ok(location) => staged.push(location),
            Err(e) => warn!("{}", e),
        }
    }
    staged
}

// Files already on disk under the server-supplied name are reused rather
// than re-downloaded.
async fn write_payload_to_disk(
    contact: &Arc<dyn Contact>,
    profile: &Value,
    payload: &str,
) -> Result<String> {
    info!("Fetching new payload bytes: {}", payload);
    let (bytes, filename) = contact.get_payload_bytes(profile, payload).await;
    if bytes.is_empty() || filename.is_empty() {
        return Err(AgentError::PayloadFetch(payload.to_string()));
    }
    if Path::new(&filename).exists() {
        info!("File {} already exists", filename);
        return Ok(filename);
    }
    write_payload_bytes(&filename, &bytes).await?;
    Ok(filename)
}

async fn write_payload_bytes(location: &str, payload: &[u8]) -> Result<()> {
    tokio::fs::write(location, payload).await?;
    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(location, Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}

/// Best-effort removal of staged payloads once the owning instruction has
/// finished.
pub async fn remove_staged(paths: &[String]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("Could not remove staged payload {}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockContact;
    use serde_json::json;

    fn unique_name(tag: &str) -> String {
        format!(
            "{}/marten_payload_{}_{}",
            std::env::temp_dir().display(),
            tag,
            std::process::id()
        )
    }

    #[tokio::test]
    async fn stages_payloads_and_skips_failures() {
        let name = unique_name("stage");
        let contact = MockContact::new("HTTP");
        contact.add_payload(&name, b"#!/bin/sh\n".to_vec());
        let contact: Arc<dyn Contact> = Arc::new(contact);

        let staged = stage_payloads(
            &contact,
            &json!({"paw": "p"}),
            &[name.clone(), "missing.bin".to_string()],
        )
        .await;

        assert_eq!(staged, vec![name.clone()]);
        assert!(Path::new(&name).exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&name).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        remove_staged(&staged).await;
        assert!(!Path::new(&name).exists());
    }

    #[tokio::test]
    async fn existing_files_are_not_refetched() {
        let name = unique_name("reuse");
        std::fs::write(&name, b"original").unwrap();

        let contact = MockContact::new("HTTP");
        contact.add_payload(&name, b"replacement".to_vec());
        let contact: Arc<dyn Contact> = Arc::new(contact);

        let staged = stage_payloads(&contact, &json!({}), &[name.clone()]).await;
        assert_eq!(staged, vec![name.clone()]);
        assert_eq!(std::fs::read(&name).unwrap(), b"original");

        std::fs::remove_file(&name).unwrap();
    }

    #[tokio::test]
    async fn removal_is_best_effort() {
        remove_staged(&["does_not_exist_anywhere.bin".to_string()]).await;
    }
}
