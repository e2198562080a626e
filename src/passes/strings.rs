//! String decryption passes.
//!
//! Two string protections are reversed:
//!
//! - **Static encryption**: literals are stored base64-encoded and routed
//!   through a decryptor method at runtime. The decryptor is located once
//!   per run (at least one parameter, returns a string, body calls into a
//!   cryptography type) and every `ldstr X; call decryptor` pair is decoded
//!   in place, dropping the call. Literals that do not decode cleanly are
//!   left exactly as found.
//! - **Online decryption**: literals embedding the decryption-service URL
//!   would fetch their plaintext over the network. They are swapped for a
//!   fixed offline placeholder so the output never phones home.

use std::sync::atomic::{AtomicUsize, Ordering};

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::{
    events::{truncate_string, EventKind},
    integrity,
    model::{Body, MethodRef, Module, Opcode, Operand, Token, TypeSig},
    passes::{PassContext, ProtectionPass},
    Result,
};

/// Type-name fragments that mark a callee as cryptographic.
const DECRYPTOR_TYPE_MARKERS: [&str; 3] = ["Crypto", "Rijndael", "AES"];

/// The decryption service obfuscated binaries call out to.
const ONLINE_SERVICE_URL: &str = "https://communitykeyv1.000webhostapp.com/Decoder4.php?string=";

/// Literal substituted for online-decryption strings.
const OFFLINE_PLACEHOLDER: &str = "DECRYPTED_OFFLINE";

fn calls_crypto_type(module: &Module, body: &Body) -> bool {
    body.iter().any(|(_, instruction)| {
        if instruction.opcode != Opcode::Call {
            return false;
        }
        instruction.operand.as_method().is_some_and(|m| match m {
            MethodRef::External(external) => {
                let full = external.full_type_name();
                DECRYPTOR_TYPE_MARKERS.iter().any(|k| full.contains(k))
            }
            MethodRef::Def(token) => module.type_of_method(*token).is_some_and(|ty| {
                let full = ty.full_name();
                DECRYPTOR_TYPE_MARKERS.iter().any(|k| full.contains(k))
            }),
        })
    })
}

/// Locates the module's string decryptor.
///
/// A decryptor takes at least one argument, returns a string and performs
/// cryptographic calls somewhere in its body.
fn find_decryptor(module: &Module) -> Option<Token> {
    for ty in &module.types {
        for method in &ty.methods {
            if method.params.is_empty() || method.return_type != TypeSig::Str {
                continue;
            }
            let Some(body) = method.body.as_ref() else {
                continue;
            };
            if calls_crypto_type(module, body) {
                return Some(method.token);
            }
        }
    }
    None
}

fn decode_literal(literal: &str) -> Option<String> {
    let bytes = STANDARD.decode(literal).ok()?;
    String::from_utf8(bytes).ok()
}

/// Decodes statically-encrypted string literals.
pub struct EncryptedStringPass;

impl ProtectionPass for EncryptedStringPass {
    fn name(&self) -> &'static str {
        "Encrypted Strings"
    }

    fn description(&self) -> &'static str {
        "Decode base64 literals routed through the module's string decryptor"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let decryptor = *ctx.caches.decryptor.get_or_init(|| find_decryptor(module));
        let Some(decryptor) = decryptor else {
            return Ok(false);
        };

        let decrypted = AtomicUsize::new(0);
        module.par_for_each_method_mut(|method| {
            let token = method.token;
            let Some(body) = method.body.as_mut() else {
                return;
            };
            let mut in_body = 0;
            let order = body.ids();
            for position in 1..order.len() {
                let (literal_id, call_id) = (order[position - 1], order[position]);
                let (Some(literal), Some(call)) = (body.get(literal_id), body.get(call_id))
                else {
                    continue;
                };
                if call.opcode != Opcode::Call
                    || call.operand.as_method().and_then(MethodRef::as_def) != Some(decryptor)
                {
                    continue;
                }
                if literal.opcode != Opcode::LdStr {
                    continue;
                }
                let Some(encrypted) = literal.operand.as_str() else {
                    continue;
                };
                if encrypted.is_empty() {
                    continue;
                }
                let Some(decoded) = decode_literal(encrypted) else {
                    continue;
                };

                let message = format!("'{}' decrypted", truncate_string(&decoded, 32));
                if let Some(literal) = body.get_mut(literal_id) {
                    literal.operand = Operand::Str(decoded);
                }
                body.remove(call_id);
                ctx.events
                    .record(EventKind::StringDecrypted)
                    .at(token, position - 1)
                    .message(message);
                in_body += 1;
            }
            if in_body > 0 {
                integrity::repair_body(body);
                decrypted.fetch_add(in_body, Ordering::Relaxed);
            }
        });

        let total = decrypted.load(Ordering::Relaxed);
        if total > 0 {
            ctx.logger.info(&format!("Decrypted {total} string(s)"));
        }
        Ok(total > 0)
    }
}

/// Replaces online-decryption literals with an offline placeholder.
pub struct OnlineStringPass;

impl ProtectionPass for OnlineStringPass {
    fn name(&self) -> &'static str {
        "Online String Decryption"
    }

    fn description(&self) -> &'static str {
        "Replace decryption-service URLs with a fixed offline literal"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let replaced = AtomicUsize::new(0);
        module.par_for_each_method_mut(|method| {
            let token = method.token;
            let Some(body) = method.body.as_mut() else {
                return;
            };
            let mut in_body = 0;
            for id in body.ids() {
                let Some(instruction) = body.get(id) else {
                    continue;
                };
                if instruction.opcode != Opcode::LdStr {
                    continue;
                }
                let is_online = instruction
                    .operand
                    .as_str()
                    .is_some_and(|s| s.contains(ONLINE_SERVICE_URL));
                if !is_online {
                    continue;
                }
                let position = body.position_of(id).unwrap_or(0);
                if let Some(instruction) = body.get_mut(id) {
                    instruction.operand = Operand::Str(OFFLINE_PLACEHOLDER.to_string());
                }
                ctx.events
                    .record(EventKind::StringDecrypted)
                    .at(token, position)
                    .message("online decryption replaced with offline placeholder");
                in_body += 1;
            }
            if in_body > 0 {
                replaced.fetch_add(in_body, Ordering::Relaxed);
            }
        });

        let total = replaced.load(Ordering::Relaxed);
        if total > 0 {
            ctx.logger
                .info(&format!("Replaced {total} online decryption call(s)"));
        }
        Ok(total > 0)
    }
}
