//! Transactions in the legacy wire layout.

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;
use crate::Hash256;

const MAX_INPUTS: u64 = 1_000_000;
const MAX_OUTPUTS: u64 = 1_000_000;
const MAX_SCRIPT_BYTES: usize = 10_000_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.consensus_encode_to(&mut encoder);
        encoder.into_inner()
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.previous_output.consensus_encode_to(encoder);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(payload);
        Self::consensus_decode_from(&mut decoder)
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;

        let input_count = decoder.read_varint()?;
        if input_count > MAX_INPUTS {
            return Err(DecodeError::Oversized);
        }
        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            let previous_output = OutPoint::consensus_decode_from(decoder)?;
            let script_sig = read_script(decoder)?;
            let sequence = decoder.read_u32_le()?;
            inputs.push(TxIn {
                previous_output,
                script_sig,
                sequence,
            });
        }

        let output_count = decoder.read_varint()?;
        if output_count > MAX_OUTPUTS {
            return Err(DecodeError::Oversized);
        }
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            let value = decoder.read_i64_le()?;
            let script_pubkey = read_script(decoder)?;
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }

        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}

fn read_script(decoder: &mut Decoder<'_>) -> Result<Vec<u8>, DecodeError> {
    let bytes = decoder.read_var_bytes()?;
    if bytes.len() > MAX_SCRIPT_BYTES {
        return Err(DecodeError::Oversized);
    }
    Ok(bytes.to_vec())
}
