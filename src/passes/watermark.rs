//! Watermark literal removal.
//!
//! Obfuscators sign their output with string literals naming the product or
//! pointing at bundled watermark images. Any `ldstr` whose literal
//! case-insensitively contains one of the known markers is removed. Bodies
//! are scanned back-to-front so removal positions stay valid within a sweep.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    events::{truncate_string, EventKind},
    integrity,
    model::{Module, Opcode},
    passes::{PassContext, ProtectionPass},
    Result,
};

/// Substrings that brand a string literal as a watermark.
const WATERMARK_MARKERS: [&str; 5] = ["obfuscator", "protection", "watermark", ".jpg", ".png"];

fn is_watermark(literal: &str) -> bool {
    let lower = literal.to_lowercase();
    WATERMARK_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Removes watermark string literals.
pub struct WatermarkPass;

impl ProtectionPass for WatermarkPass {
    fn name(&self) -> &'static str {
        "Watermarks"
    }

    fn description(&self) -> &'static str {
        "Remove string literals branding the module with obfuscator watermarks"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext<'_>) -> Result<bool> {
        let removed = AtomicUsize::new(0);
        module.par_for_each_method_mut(|method| {
            let token = method.token;
            let Some(body) = method.body.as_mut() else {
                return;
            };
            let mut in_body = 0;
            for id in body.ids().into_iter().rev() {
                let Some(instruction) = body.get(id) else {
                    continue;
                };
                if instruction.opcode != Opcode::LdStr {
                    continue;
                }
                let Some(literal) = instruction.operand.as_str() else {
                    continue;
                };
                if !is_watermark(literal) {
                    continue;
                }
                let position = body.position_of(id).unwrap_or(0);
                let message = format!("watermark '{}' removed", truncate_string(literal, 40));
                body.remove(id);
                ctx.events
                    .record(EventKind::WatermarkRemoved)
                    .at(token, position)
                    .message(message);
                in_body += 1;
            }
            if in_body > 0 {
                integrity::repair_body(body);
                removed.fetch_add(in_body, Ordering::Relaxed);
            }
        });

        let total = removed.load(Ordering::Relaxed);
        if total > 0 {
            ctx.logger.info(&format!("Removed {total} watermark(s)"));
        }
        Ok(total > 0)
    }
}
