//! Runestone encoding: `OP_RETURN OP_13` followed by LEB128 tag/value integers.

use bitcoin::{
    opcodes::all::{OP_PUSHNUM_13, OP_RETURN},
    script::{Builder, Instruction, PushBytesBuf},
    ScriptBuf, Transaction,
};
use thiserror::Error;

use super::types::{Edict, RuneId};

/// Largest data push allowed in a runestone script.
pub const MAX_PUSH: usize = 520;

const TAG_BODY: u128 = 0;
const TAG_POINTER: u128 = 22;

/// A runestone that could not be encoded, or decoded as anything but a cenotaph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunestoneError {
    /// The payload is malformed.
    #[error("cenotaph: {0}")]
    Cenotaph(&'static str),

    /// The script could not be built.
    #[error("could not build runestone script: {0}")]
    Script(String),
}

/// Edicts plus the output that receives unallocated runes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Runestone {
    /// Transfers, in any order.
    pub edicts: Vec<Edict>,
    /// Output receiving runes not moved by an edict.
    pub pointer: Option<u32>,
}

fn encode_varint(mut n: u128, out: &mut Vec<u8>) {
    while n >> 7 > 0 {
        out.push((n as u8 & 0x7f) | 0x80);
        n >>= 7;
    }
    out.push(n as u8);
}

fn decode_varint(buf: &[u8]) -> Result<(u128, usize), RunestoneError> {
    let mut n = 0u128;
    for (i, &byte) in buf.iter().enumerate() {
        if i > 18 {
            return Err(RunestoneError::Cenotaph("varint too long"));
        }
        let value = u128::from(byte & 0x7f);
        if i == 18 && value & 0b0111_1100 != 0 {
            return Err(RunestoneError::Cenotaph("varint overflow"));
        }
        n |= value << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((n, i + 1));
        }
    }
    Err(RunestoneError::Cenotaph("truncated varint"))
}

impl Runestone {
    /// The integer payload, before being split into pushes.
    fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        if let Some(pointer) = self.pointer {
            encode_varint(TAG_POINTER, &mut payload);
            encode_varint(u128::from(pointer), &mut payload);
        }

        if !self.edicts.is_empty() {
            encode_varint(TAG_BODY, &mut payload);
            let mut edicts = self.edicts.clone();
            edicts.sort_by_key(|edict| edict.id);

            let mut previous = RuneId::default();
            for edict in edicts {
                let block_delta = edict.id.block - previous.block;
                let tx_delta = if block_delta == 0 {
                    edict.id.tx - previous.tx
                } else {
                    edict.id.tx
                };
                encode_varint(u128::from(block_delta), &mut payload);
                encode_varint(u128::from(tx_delta), &mut payload);
                encode_varint(edict.amount, &mut payload);
                encode_varint(u128::from(edict.output), &mut payload);
                previous = edict.id;
            }
        }
        payload
    }

    /// The `OP_RETURN OP_13 <payload>` output script.
    pub fn encipher(&self) -> Result<ScriptBuf, RunestoneError> {
        let mut builder = Builder::new()
            .push_opcode(OP_RETURN)
            .push_opcode(OP_PUSHNUM_13);
        for chunk in self.payload().chunks(MAX_PUSH) {
            let push = PushBytesBuf::try_from(chunk.to_vec())
                .map_err(|e| RunestoneError::Script(e.to_string()))?;
            builder = builder.push_slice(push);
        }
        Ok(builder.into_script())
    }

    /// Decodes the first runestone output of `tx`, if any.
    pub fn decipher(tx: &Transaction) -> Result<Option<Self>, RunestoneError> {
        let Some(payload) = Self::find_payload(tx)? else {
            return Ok(None);
        };

        let mut integers = Vec::new();
        let mut rest = payload.as_slice();
        while !rest.is_empty() {
            let (value, len) = decode_varint(rest)?;
            integers.push(value);
            rest = &rest[len..];
        }

        let mut runestone = Self::default();
        let mut fields = integers.as_slice();
        while let [tag, tail @ ..] = fields {
            if *tag == TAG_BODY {
                runestone.edicts = decode_edicts(tail, tx.output.len())?;
                break;
            }
            let [value, tail @ ..] = tail else {
                return Err(RunestoneError::Cenotaph("truncated field"));
            };
            match *tag {
                TAG_POINTER => {
                    let pointer = u32::try_from(*value)
                        .ok()
                        .filter(|p| (*p as usize) < tx.output.len())
                        .ok_or(RunestoneError::Cenotaph("pointer out of range"))?;
                    runestone.pointer = Some(pointer);
                }
                tag if tag % 2 == 0 => return Err(RunestoneError::Cenotaph("unrecognized even tag")),
                _ => {}
            }
            fields = tail;
        }

        Ok(Some(runestone))
    }

    fn find_payload(tx: &Transaction) -> Result<Option<Vec<u8>>, RunestoneError> {
        for output in &tx.output {
            let mut instructions = output.script_pubkey.instructions();
            if instructions.next() != Some(Ok(Instruction::Op(OP_RETURN))) {
                continue;
            }
            if instructions.next() != Some(Ok(Instruction::Op(OP_PUSHNUM_13))) {
                continue;
            }

            let mut payload = Vec::new();
            for instruction in instructions {
                match instruction {
                    Ok(Instruction::PushBytes(push)) => payload.extend_from_slice(push.as_bytes()),
                    Ok(Instruction::Op(_)) => {
                        return Err(RunestoneError::Cenotaph("opcode in runestone"))
                    }
                    Err(_) => return Err(RunestoneError::Cenotaph("invalid script")),
                }
            }
            return Ok(Some(payload));
        }
        Ok(None)
    }
}

fn decode_edicts(integers: &[u128], num_outputs: usize) -> Result<Vec<Edict>, RunestoneError> {
    if integers.len() % 4 != 0 {
        return Err(RunestoneError::Cenotaph("trailing integers in body"));
    }
    let mut edicts = Vec::with_capacity(integers.len() / 4);
    let mut previous = RuneId::default();
    for chunk in integers.chunks_exact(4) {
        let block_delta =
            u64::try_from(chunk[0]).map_err(|_| RunestoneError::Cenotaph("edict rune id"))?;
        let tx_delta =
            u32::try_from(chunk[1]).map_err(|_| RunestoneError::Cenotaph("edict rune id"))?;
        let id = if block_delta == 0 {
            RuneId {
                block: previous.block,
                tx: previous
                    .tx
                    .checked_add(tx_delta)
                    .ok_or(RunestoneError::Cenotaph("edict rune id"))?,
            }
        } else {
            RuneId {
                block: previous
                    .block
                    .checked_add(block_delta)
                    .ok_or(RunestoneError::Cenotaph("edict rune id"))?,
                tx: tx_delta,
            }
        };
        let output = u32::try_from(chunk[3])
            .ok()
            .filter(|o| (*o as usize) <= num_outputs)
            .ok_or(RunestoneError::Cenotaph("edict output"))?;

        edicts.push(Edict {
            id,
            amount: chunk[2],
            output,
        });
        previous = id;
    }
    Ok(edicts)
}
