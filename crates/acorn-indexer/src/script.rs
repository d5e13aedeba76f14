//! NEO VM script reading and building.
//!
//! The chain encodes contract invocations as a flat byte script of push
//! opcodes. Reading one yields an ordered list of `(opcode, data)` items;
//! popping consumes the most recently parsed item first, which is the order
//! contract arguments come back off the stack.

use num_bigint::BigInt;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

pub const OP_PUSH0: u8 = 0x00;
const OP_PUSHBYTES_MAX: u8 = 0x4B;
const OP_PUSHDATA1: u8 = 0x4C;
const OP_PUSHDATA2: u8 = 0x4D;
const OP_PUSHDATA4: u8 = 0x4E;
pub const OP_PUSHM1: u8 = 0x4F;
pub const OP_PUSH1: u8 = 0x51;
pub const OP_PUSH16: u8 = 0x60;
pub const OP_APPCALL: u8 = 0x67;
pub const OP_PACK: u8 = 0xC1;

/// Address version byte of the chain; prepended before Base58Check encoding.
const ADDRESS_VERSION: u8 = 0x17;

/// Parsed opcode/data items of an invocation script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataStack {
    items: Vec<(u8, Vec<u8>)>,
}

impl DataStack {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Pop the most recently parsed item.
    pub fn pop_item(&mut self) -> Option<(u8, Vec<u8>)> {
        self.items.pop()
    }

    /// Pop the most recently parsed item, keeping only its data.
    pub fn pop_data(&mut self) -> Option<Vec<u8>> {
        self.items.pop().map(|(_, data)| data)
    }
}

/// Parse a hex-encoded script into its opcode/data items.
/// Returns `None` for scripts that are not valid hex or are truncated
/// mid-operand; callers treat those like an empty script.
pub fn read_script(script: &str) -> Option<DataStack> {
    let bytes = hex::decode(script).ok()?;
    let mut items = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let op = bytes[pos];
        pos += 1;

        let data = match op {
            OP_PUSH0 => vec![0],
            OP_PUSHM1 => vec![0xFF],
            n @ 0x01..=OP_PUSHBYTES_MAX => take(&bytes, &mut pos, n as usize)?,
            OP_PUSHDATA1 => {
                let len = take(&bytes, &mut pos, 1)?[0] as usize;
                take(&bytes, &mut pos, len)?
            }
            OP_PUSHDATA2 => {
                let len_bytes = take(&bytes, &mut pos, 2)?;
                let len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
                take(&bytes, &mut pos, len)?
            }
            OP_PUSHDATA4 => {
                let len_bytes = take(&bytes, &mut pos, 4)?;
                let len =
                    u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
                        as usize;
                take(&bytes, &mut pos, len)?
            }
            n @ OP_PUSH1..=OP_PUSH16 => vec![n - OP_PUSH1 + 1],
            OP_APPCALL => take(&bytes, &mut pos, 20)?,
            _ => Vec::new(),
        };

        items.push((op, data));
    }

    Some(DataStack { items })
}

fn take(bytes: &[u8], pos: &mut usize, len: usize) -> Option<Vec<u8>> {
    let end = pos.checked_add(len)?;
    if end > bytes.len() {
        return None;
    }
    let out = bytes[*pos..end].to_vec();
    *pos = end;
    Some(out)
}

// ---------------------------------------------------------------------------
// Script builder for read-only invocations
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptBuilder {
    buf: Vec<u8>,
}

impl ScriptBuilder {
    fn emit(&mut self, op: u8) {
        self.buf.push(op);
    }

    fn emit_push(&mut self, number: i64) {
        if number == -1 {
            self.emit(OP_PUSHM1);
        } else if number == 0 {
            self.emit(OP_PUSH0);
        } else if number > 0 && number <= 16 {
            self.emit(OP_PUSH1 - 1 + number as u8);
        } else {
            self.emit_push_bytes(&int_to_bytes(&BigInt::from(number)));
        }
    }

    fn emit_push_bytes(&mut self, data: &[u8]) {
        let length = data.len();
        if length <= OP_PUSHBYTES_MAX as usize {
            self.buf.push(length as u8);
        } else if length <= 0xFF {
            self.emit(OP_PUSHDATA1);
            self.buf.push(length as u8);
        } else if length <= 0xFFFF {
            self.emit(OP_PUSHDATA2);
            self.buf.extend_from_slice(&(length as u16).to_le_bytes());
        } else {
            self.emit(OP_PUSHDATA4);
            self.buf.extend_from_slice(&(length as u32).to_le_bytes());
        }
        self.buf.extend_from_slice(data);
    }

    fn emit_app_call(&mut self, script_hash: &[u8]) {
        self.emit(OP_APPCALL);
        self.buf.extend_from_slice(script_hash);
    }
}

/// Build the hex script for a single contract method call:
/// params reversed, param count, PACK, method name, APPCALL.
/// Returns `None` when the script hash is not 20 bytes or a param is empty.
pub fn method_call_script(script_hash: &[u8], method: &str, params: &[Vec<u8>]) -> Option<String> {
    if script_hash.len() != 20 || method.is_empty() || params.iter().any(|p| p.is_empty()) {
        return None;
    }

    let mut sb = ScriptBuilder::default();
    for param in params.iter().rev() {
        sb.emit_push_bytes(param);
    }
    sb.emit_push(params.len() as i64);
    sb.emit(OP_PACK);
    sb.emit_push_bytes(method.as_bytes());
    sb.emit_app_call(script_hash);

    Some(hex::encode(sb.buf))
}

/// Script for a `properties(tokenId)` call. Token ids are decimal strings;
/// anything unparseable skips the call.
pub fn properties_script(script_hash: &[u8], token_id: &str) -> Option<String> {
    let id: BigInt = token_id.parse().ok()?;
    method_call_script(script_hash, "properties", &[int_to_bytes(&id)])
}

/// Minimal two's-complement little-endian encoding, the VM's integer format.
fn int_to_bytes(n: &BigInt) -> Vec<u8> {
    n.to_signed_bytes_le()
}

// ---------------------------------------------------------------------------
// Hashing and addresses
// ---------------------------------------------------------------------------

/// RIPEMD160(SHA256(data)) — the script hash of a contract or verification
/// script.
pub fn script_hash(data: &[u8]) -> Vec<u8> {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).to_vec()
}

/// Asset ids are the script hash in reversed (display) byte order, hex.
pub fn asset_id_from_script_hash(hash: &[u8]) -> String {
    let mut reversed = hash.to_vec();
    reversed.reverse();
    hex::encode(reversed)
}

/// Inverse of [`asset_id_from_script_hash`]; `None` unless the id decodes to
/// exactly 20 bytes.
pub fn script_hash_from_asset_id(asset_id: &str) -> Option<Vec<u8>> {
    let mut bytes = hex::decode(asset_id).ok()?;
    if bytes.len() != 20 {
        return None;
    }
    bytes.reverse();
    Some(bytes)
}

/// Base58Check address of a script hash. Empty input gives the empty string;
/// transfer notifications use that for mint/burn parties.
pub fn address_from_script_hash(hash: &[u8]) -> String {
    if hash.is_empty() {
        return String::new();
    }
    let mut payload = Vec::with_capacity(1 + hash.len());
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(hash);
    bs58::encode(payload).with_check().into_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_small_int_pushes() {
        let stack = read_script("004f5160").unwrap();
        let items: Vec<(u8, Vec<u8>)> = {
            let mut s = stack;
            let mut v = Vec::new();
            while let Some(item) = s.pop_item() {
                v.push(item);
            }
            v.reverse();
            v
        };
        assert_eq!(
            items,
            vec![
                (0x00, vec![0]),
                (0x4F, vec![0xFF]),
                (0x51, vec![1]),
                (0x60, vec![16]),
            ]
        );
    }

    #[test]
    fn reads_pushdata_forms() {
        let mut stack = read_script("02abcd4c02abcd4d0200abcd4e02000000abcd").unwrap();
        assert_eq!(stack.len(), 4);
        for _ in 0..4 {
            assert_eq!(stack.pop_data(), Some(vec![0xAB, 0xCD]));
        }
    }

    #[test]
    fn reads_appcall_with_script_hash() {
        let hash = [0x11u8; 20];
        let script = format!("67{}", hex::encode(hash));
        let mut stack = read_script(&script).unwrap();
        assert_eq!(stack.pop_item(), Some((OP_APPCALL, hash.to_vec())));
    }

    #[test]
    fn rejects_truncated_scripts() {
        assert!(read_script("0a").is_none());
        assert!(read_script("4d02").is_none());
        assert!(read_script("6711").is_none());
        assert!(read_script("zz").is_none());
    }

    #[test]
    fn method_call_script_round_trips() {
        let hash = [0x22u8; 20];
        let params = vec![vec![0xAA], vec![0xBB, 0xBB]];
        let script = method_call_script(&hash, "transfer", &params).unwrap();

        let mut stack = read_script(&script).unwrap();
        assert_eq!(stack.pop_item(), Some((OP_APPCALL, hash.to_vec())));
        assert_eq!(stack.pop_data(), Some(b"transfer".to_vec()));
        assert_eq!(stack.pop_item().map(|(op, _)| op), Some(OP_PACK));
        assert_eq!(stack.pop_data(), Some(vec![2]));
        // Params are emitted reversed so they pop back in declared order.
        assert_eq!(stack.pop_data(), Some(vec![0xAA]));
        assert_eq!(stack.pop_data(), Some(vec![0xBB, 0xBB]));
        assert!(stack.is_empty());
    }

    #[test]
    fn method_call_script_rejects_bad_hash() {
        assert!(method_call_script(&[0u8; 19], "name", &[]).is_none());
    }

    #[test]
    fn int_encoding_is_minimal_twos_complement() {
        assert_eq!(int_to_bytes(&BigInt::from(0)), vec![0]);
        assert_eq!(int_to_bytes(&BigInt::from(1)), vec![1]);
        assert_eq!(int_to_bytes(&BigInt::from(-1)), vec![0xFF]);
        assert_eq!(int_to_bytes(&BigInt::from(255)), vec![0xFF, 0x00]);
        assert_eq!(int_to_bytes(&BigInt::from(256)), vec![0x00, 0x01]);
    }

    #[test]
    fn asset_id_round_trips_through_byte_reversal() {
        let hash: Vec<u8> = (0u8..20).collect();
        let asset_id = asset_id_from_script_hash(&hash);
        assert_eq!(asset_id.len(), 40);
        assert_eq!(script_hash_from_asset_id(&asset_id), Some(hash));
        assert!(script_hash_from_asset_id("abcd").is_none());
    }

    #[test]
    fn addresses_use_version_0x17() {
        let hash = script_hash(b"verification script");
        assert_eq!(hash.len(), 20);
        let addr = address_from_script_hash(&hash);
        // Version byte 0x17 always maps to the 'A' prefix, 34 chars.
        assert!(addr.starts_with('A'), "unexpected address {addr}");
        assert_eq!(addr.len(), 34);
        assert_eq!(address_from_script_hash(&[]), "");
    }
}
