//! Capability advertisement (composition data) decoding
//!
//! Layout: a 10-byte header (company, product, version, replay list size,
//! features), then element records of `location(2) numS(1) numV(1)`, `numS`
//! little-endian SIG model ids and `numV` vendor entries of
//! `company(2) model(2)`.

use crate::mesh::{Capability, ModelId};
use crate::nodes::CapabilitySet;
use crate::{Error, Result};

/// Fixed header skipped before the first element
pub const HEADER_LEN: usize = 10;

const ELEMENT_HEADER_LEN: usize = 4;
const SIG_ENTRY_LEN: usize = 2;
const VENDOR_ENTRY_LEN: usize = 4;

/// Decoded advertisement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Composition {
    /// Known capabilities present in the blob
    pub capabilities: CapabilitySet,
    /// Element records started
    pub elements: usize,
    /// Parsing stopped early at a truncated record
    pub truncated: bool,
}

/// Decoder for capability advertisements
#[derive(Debug, Clone, Copy, Default)]
pub struct CompositionParser;

impl CompositionParser {
    /// Decode an advertisement
    ///
    /// A record that overruns the buffer ends parsing; entries read before it
    /// are kept.
    ///
    /// # Errors
    ///
    /// Returns error if the blob is shorter than the fixed header
    pub fn parse(data: &[u8]) -> Result<Composition> {
        if data.len() < HEADER_LEN {
            return Err(Error::Composition {
                len: data.len(),
                header: HEADER_LEN,
            });
        }

        let mut out = Composition::default();
        let mut offset = HEADER_LEN;

        'elements: while offset + ELEMENT_HEADER_LEN <= data.len() {
            let num_sig = data[offset + 2];
            let num_vendor = data[offset + 3];
            offset += ELEMENT_HEADER_LEN;
            out.elements += 1;

            for _ in 0..num_sig {
                let Some(entry) = data.get(offset..offset + SIG_ENTRY_LEN) else {
                    out.truncated = true;
                    break 'elements;
                };
                let id = u16::from_le_bytes([entry[0], entry[1]]);
                offset += SIG_ENTRY_LEN;
                record(&mut out.capabilities, ModelId::sig(id));
            }

            for _ in 0..num_vendor {
                let Some(entry) = data.get(offset..offset + VENDOR_ENTRY_LEN) else {
                    out.truncated = true;
                    break 'elements;
                };
                let company = u16::from_le_bytes([entry[0], entry[1]]);
                let id = u16::from_le_bytes([entry[2], entry[3]]);
                offset += VENDOR_ENTRY_LEN;
                record(&mut out.capabilities, ModelId::vendor(company, id));
            }
        }

        if offset < data.len() {
            out.truncated = true;
        }

        Ok(out)
    }
}

fn record(set: &mut CapabilitySet, model: ModelId) {
    if let Some(cap) = Capability::from_model(model) {
        tracing::debug!(capability = cap.name(), "found model");
        set.insert(cap);
    }
}
