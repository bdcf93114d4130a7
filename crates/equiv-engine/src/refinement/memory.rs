//! Reading memory-related facts out of a counterexample model.

use equiv_ir::CmdPointer;
use equiv_smt::ProgramModel;
use num_bigint::{BigInt, Sign};
use num_traits::ToPrimitive;
use tracing::debug;

use crate::checker::Instrumentation;
use crate::instrumentation::BufferCapture;

const WORD: usize = 32;

/// Finds havocked loads whose value disagrees with what memory held.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryImprecisionAnalyzer;

impl MemoryImprecisionAnalyzer {
    /// The first load of `side` that returned a value memory did not hold,
    /// with the precision window it should be given.
    pub fn analyze(model: &ProgramModel, side: &Instrumentation) -> Option<(CmdPointer, u32)> {
        let call = side.call_id;
        side.result.sites.iter().find_map(|(ptr, info)| {
            let load = info.load.as_ref()?;
            if model.bool(&load.hit.indexed(call)) != Some(true) {
                return None;
            }
            let value = model.int(&load.value.indexed(call))?;
            let shadow = model.int(&load.shadow.indexed(call))?;
            if value == shadow {
                return None;
            }
            debug!(site = %ptr, %value, %shadow, "load diverged from memory");
            Some((*ptr, 1))
        })
    }
}

/// Big-endian bytes of the 256-bit word `value`.
pub fn word_bytes(value: &BigInt) -> [u8; WORD] {
    let modulus = BigInt::from(1u8) << (8 * WORD);
    let mut v = value % &modulus;
    if v.sign() == Sign::Minus {
        v += &modulus;
    }
    let (_, digits) = v.to_bytes_be();
    let mut out = [0u8; WORD];
    out[WORD - digits.len()..].copy_from_slice(&digits);
    out
}

/// Contents of a captured buffer under `model`, when the capture holds
/// every word of it.
pub fn precise_buffer_bytes(
    model: &ProgramModel,
    capture: &BufferCapture,
    call: u32,
) -> Option<Vec<u8>> {
    let len = model.int(&capture.length.indexed(call))?.to_usize()?;
    let words = len.div_ceil(WORD);
    if words > capture.words.len() {
        return None;
    }
    let mut bytes = Vec::with_capacity(words * WORD);
    for w in capture.words.iter().take(words) {
        let value = model.int(&w.indexed(call))?;
        bytes.extend_from_slice(&word_bytes(value));
    }
    bytes.truncate(len);
    Some(bytes)
}
