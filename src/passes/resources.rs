//! Embedded-resource restoration passes.
//!
//! Two resource protections are reversed:
//!
//! - **XOR encryption**: large resources whose byte-value spread looks like
//!   ciphertext are decrypted in place with the scheme's fixed single-byte
//!   key.
//! - **Name and payload markers**: protection markers embedded in resource
//!   names are stripped, and padding prefixes planted in front of the real
//!   payload are removed.

use crate::{
    events::EventKind,
    model::{Module, Resource},
    passes::{PassContext, ProtectionPass},
    Result,
};

/// Name fragments that mark a resource as protected.
const RESOURCE_NAME_MARKERS: [&str; 4] = ["encrypted_", "protected_", "obfuscated_", "hidden_"];

/// Counts distinct byte values in a payload. Used as a cheap entropy proxy:
/// ciphertext touches most of the byte range, plain resources rarely do.
fn byte_spread(data: &[u8]) -> usize {
    let mut seen = [false; 256];
    for byte in data {
        seen[*byte as usize] = true;
    }
    seen.iter().filter(|present| **present).count()
}

fn looks_encrypted(resource: &Resource, min_len: usize, entropy_threshold: usize) -> bool {
    resource.data.len() >= min_len && byte_spread(&resource.data) > entropy_threshold
}

/// Removes every marker occurrence from a resource name, case-insensitively.
/// Returns `None` when the name carries no marker.
fn strip_name_markers(name: &str) -> Option<String> {
    let mut stripped = name.to_string();
    loop {
        let lower = stripped.to_lowercase();
        let Some((start, marker)) = RESOURCE_NAME_MARKERS
            .iter()
            .filter_map(|marker| lower.find(marker).map(|start| (start, *marker)))
            .min_by_key(|(start, _)| *start)
        else {
            break;
        };
        stripped.replace_range(start..start + marker.len(), "");
    }
    (stripped != name).then_some(stripped)
}

/// Returns true if the payload starts with a planted padding prefix: four
/// identical `0x00` or `0xFF` bytes.
fn has_padding_prefix(data: &[u8]) -> bool {
    data.len() >= 4 && (data[..4].iter().all(|b| *b == 0x00) || data[..4].iter().all(|b| *b == 0xFF))
}

/// Decrypts XOR-encrypted resources in place.
pub struct ResourceEncryptionPass;

impl ProtectionPass for ResourceEncryptionPass {
    fn name(&self) -> &'static str {
        "Resource Encryption"
    }

    fn description(&self) -> &'static str {
        "XOR-decrypt embedded resources that look like ciphertext"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let key = ctx.config.resource_xor_key;
        let mut decrypted = 0;
        for resource in &mut module.resources {
            if !looks_encrypted(
                resource,
                ctx.config.min_encrypted_resource_len,
                ctx.config.resource_entropy_threshold,
            ) {
                continue;
            }
            for byte in &mut resource.data {
                *byte ^= key;
            }
            ctx.events
                .record(EventKind::ResourceDecrypted)
                .message(format!(
                    "'{}' decrypted ({} bytes)",
                    resource.name,
                    resource.data.len()
                ));
            decrypted += 1;
        }

        if decrypted > 0 {
            ctx.logger
                .info(&format!("Decrypted {decrypted} resource(s)"));
        }
        Ok(decrypted > 0)
    }
}

/// Strips protection markers from resource names and payloads.
pub struct ResourceProtectionPass;

impl ProtectionPass for ResourceProtectionPass {
    fn name(&self) -> &'static str {
        "Resource Protections"
    }

    fn description(&self) -> &'static str {
        "Strip protection markers from resource names and padding prefixes from payloads"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let mut restored = 0;
        for resource in &mut module.resources {
            let mut touched = false;

            if let Some(stripped) = strip_name_markers(&resource.name) {
                ctx.events
                    .record(EventKind::ResourceRestored)
                    .message(format!("'{}' renamed to '{}'", resource.name, stripped));
                resource.name = stripped;
                touched = true;
            }

            if has_padding_prefix(&resource.data) {
                let padding = resource.data[0];
                let payload_start = resource
                    .data
                    .iter()
                    .position(|b| *b != padding)
                    .unwrap_or(resource.data.len());
                resource.data.drain(..payload_start);
                ctx.events
                    .record(EventKind::ResourceRestored)
                    .message(format!(
                        "'{}' padding stripped ({payload_start} bytes)",
                        resource.name
                    ));
                touched = true;
            }

            if touched {
                restored += 1;
            }
        }

        if restored > 0 {
            ctx.logger
                .info(&format!("Restored {restored} resource(s)"));
        }
        Ok(restored > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::TestRun;

    fn ciphertext(len: usize) -> Vec<u8> {
        // Touches every byte value, so the spread check always fires.
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    #[test]
    fn test_high_spread_resource_decrypted() {
        let plain: Vec<u8> = ciphertext(512);
        let encrypted: Vec<u8> = plain.iter().map(|b| b ^ 0x42).collect();
        let mut module =
            Module::new("test.exe").with_resource(Resource::new("data.bin", encrypted));
        let run = TestRun::new();
        assert!(ResourceEncryptionPass.run(&mut module, &run.ctx()).unwrap());
        assert_eq!(module.resources[0].data, plain);
        assert!(run.events.has(EventKind::ResourceDecrypted));
    }

    #[test]
    fn test_small_or_flat_resources_left_alone() {
        let small = Resource::new("small.bin", ciphertext(50));
        let flat = Resource::new("flat.bin", vec![0x41; 500]);
        let mut module = Module::new("test.exe")
            .with_resource(small.clone())
            .with_resource(flat.clone());
        let run = TestRun::new();
        assert!(!ResourceEncryptionPass.run(&mut module, &run.ctx()).unwrap());
        assert_eq!(module.resources[0], small);
        assert_eq!(module.resources[1], flat);
    }

    #[test]
    fn test_name_markers_stripped() {
        assert_eq!(
            strip_name_markers("encrypted_config.xml").as_deref(),
            Some("config.xml")
        );
        assert_eq!(
            strip_name_markers("Protected_HIDDEN_data").as_deref(),
            Some("data")
        );
        assert_eq!(strip_name_markers("ordinary.png"), None);
    }

    #[test]
    fn test_padding_prefix_removed() {
        let mut data = vec![0x00; 8];
        data.extend_from_slice(b"payload");
        let mut module = Module::new("test.exe").with_resource(Resource::new("a.bin", data));
        let run = TestRun::new();
        assert!(ResourceProtectionPass.run(&mut module, &run.ctx()).unwrap());
        assert_eq!(module.resources[0].data, b"payload");
    }

    #[test]
    fn test_ff_padding_prefix_removed() {
        let mut data = vec![0xFF; 6];
        data.extend_from_slice(&[0x10, 0x20]);
        let mut module = Module::new("test.exe").with_resource(Resource::new("b.bin", data));
        let run = TestRun::new();
        assert!(ResourceProtectionPass.run(&mut module, &run.ctx()).unwrap());
        assert_eq!(module.resources[0].data, vec![0x10, 0x20]);
    }

    #[test]
    fn test_short_leading_zeros_not_padding() {
        let data = vec![0x00, 0x00, 0x00, 0x01, 0x02];
        let mut module =
            Module::new("test.exe").with_resource(Resource::new("c.bin", data.clone()));
        let run = TestRun::new();
        assert!(!ResourceProtectionPass.run(&mut module, &run.ctx()).unwrap());
        assert_eq!(module.resources[0].data, data);
    }

    #[test]
    fn test_name_and_payload_restored_together() {
        let mut data = vec![0x00; 4];
        data.push(0x7F);
        let mut module =
            Module::new("test.exe").with_resource(Resource::new("hidden_logo.png", data));
        let run = TestRun::new();
        assert!(ResourceProtectionPass.run(&mut module, &run.ctx()).unwrap());
        assert_eq!(module.resources[0].name, "logo.png");
        assert_eq!(module.resources[0].data, vec![0x7F]);
        assert_eq!(run.events.count_kind(EventKind::ResourceRestored), 2);
    }
}
