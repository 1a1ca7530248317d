//! Minimal JSON-RPC client for V2 pool reads.
//!
//! Only five view calls are needed, so calldata and return decoding are
//! hand-coded against fixed word offsets instead of pulling in an ABI
//! toolkit.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;

use super::chains::{normalize_address, ZERO_ADDRESS};

// Function selectors (first four bytes of the keccak of the signature).
const SEL_GET_RESERVES: &str = "0x0902f1ac"; // getReserves()
const SEL_TOKEN0: &str = "0x0dfe1681"; // token0()
const SEL_TOKEN1: &str = "0xd21220a7"; // token1()
const SEL_DECIMALS: &str = "0x313ce567"; // decimals()
const SEL_GET_PAIR: &str = "0xe6a43905"; // getPair(address,address)

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<String>,
    error: Option<serde_json::Value>,
}

/// Shared, read-only RPC client for one chain.
#[derive(Clone)]
pub struct EvmRpcClient {
    client: reqwest::Client,
    rpc_url: String,
}

impl EvmRpcClient {
    pub fn new(client: reqwest::Client, rpc_url: String) -> Self {
        Self { client, rpc_url }
    }

    pub async fn eth_call(&self, to: &str, data: &str) -> Result<Vec<u8>> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": "eth_call",
            "params": [{ "to": to, "data": data }, "latest"],
            "id": 1,
        });

        let response: JsonRpcResponse = self
            .client
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await
            .context("RPC request failed")?
            .json()
            .await
            .context("failed to parse RPC response")?;

        if let Some(err) = response.error {
            return Err(anyhow!("RPC error: {err}"));
        }

        let result = response.result.ok_or_else(|| anyhow!("empty RPC result"))?;
        hex::decode(result.trim_start_matches("0x")).context("failed to decode hex result")
    }

    /// `getReserves() -> (uint112, uint112, uint32)`
    pub async fn get_reserves(&self, pool: &str) -> Result<(u128, u128, u32)> {
        let bytes = self.eth_call(pool, SEL_GET_RESERVES).await?;
        let reserve0 = uint_from_word(&bytes, 0).context("reserve0 missing")?;
        let reserve1 = uint_from_word(&bytes, 1).context("reserve1 missing")?;
        let ts = uint_from_word(&bytes, 2).context("timestamp missing")? as u32;
        Ok((reserve0, reserve1, ts))
    }

    /// `token0() -> address`
    pub async fn token0(&self, pool: &str) -> Result<String> {
        let bytes = self.eth_call(pool, SEL_TOKEN0).await?;
        address_from_word(&bytes, 0).context("token0 missing")
    }

    /// `token1() -> address`
    pub async fn token1(&self, pool: &str) -> Result<String> {
        let bytes = self.eth_call(pool, SEL_TOKEN1).await?;
        address_from_word(&bytes, 0).context("token1 missing")
    }

    /// `decimals() -> uint8`
    pub async fn decimals(&self, token: &str) -> Result<u8> {
        let bytes = self.eth_call(token, SEL_DECIMALS).await?;
        let value = uint_from_word(&bytes, 0).context("decimals missing")?;
        u8::try_from(value).map_err(|_| anyhow!("decimals out of range: {value}"))
    }

    /// `getPair(address, address) -> address`; `None` when the factory has
    /// no pool for the pair.
    pub async fn get_pair(&self, factory: &str, a: &str, b: &str) -> Result<Option<String>> {
        let data = format!(
            "{}{}{}",
            SEL_GET_PAIR,
            encode_address(a)?,
            encode_address(b)?
        );
        let bytes = self.eth_call(factory, &data).await?;
        let pair = address_from_word(&bytes, 0).context("pair address missing")?;
        if pair == ZERO_ADDRESS {
            Ok(None)
        } else {
            Ok(Some(pair))
        }
    }
}

fn word(bytes: &[u8], index: usize) -> Option<&[u8]> {
    let start = index * 32;
    bytes.get(start..start + 32)
}

/// Big-endian uint from a 32-byte word; values above u128 are out of scope
/// for the types we read (uint112, uint32, uint8).
fn uint_from_word(bytes: &[u8], index: usize) -> Option<u128> {
    let word = word(bytes, index)?;
    if word[..16].iter().any(|&b| b != 0) {
        return None;
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&word[16..32]);
    Some(u128::from_be_bytes(buf))
}

fn address_from_word(bytes: &[u8], index: usize) -> Option<String> {
    let word = word(bytes, index)?;
    Some(format!("0x{}", hex::encode(&word[12..32])))
}

/// Left-pad an address to a 32-byte calldata word (no 0x prefix).
fn encode_address(address: &str) -> Result<String> {
    let stripped = normalize_address(address);
    let stripped = stripped.trim_start_matches("0x");
    let raw = hex::decode(stripped).context("invalid address hex")?;
    if raw.len() != 20 {
        return Err(anyhow!("address must be 20 bytes, got {}", raw.len()));
    }
    Ok(format!("{}{}", "0".repeat(24), hex::encode(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_words(values: &[[u8; 32]]) -> Vec<u8> {
        values.iter().flat_map(|w| w.iter().copied()).collect()
    }

    fn uint_word(value: u128) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[16..32].copy_from_slice(&value.to_be_bytes());
        word
    }

    #[test]
    fn test_uint_from_word() {
        let bytes = encode_words(&[uint_word(1_000_000_000_000_000_000_000_000u128)]);
        assert_eq!(
            uint_from_word(&bytes, 0),
            Some(1_000_000_000_000_000_000_000_000u128)
        );
        assert_eq!(uint_from_word(&bytes, 1), None);
    }

    #[test]
    fn test_reserves_word_layout() {
        let bytes = encode_words(&[uint_word(123), uint_word(456), uint_word(1_700_000_000)]);
        assert_eq!(uint_from_word(&bytes, 0), Some(123));
        assert_eq!(uint_from_word(&bytes, 1), Some(456));
        assert_eq!(uint_from_word(&bytes, 2), Some(1_700_000_000));
    }

    #[test]
    fn test_address_from_word() {
        let mut word = [0u8; 32];
        word[12..32].copy_from_slice(&[0xab; 20]);
        let bytes = encode_words(&[word]);
        assert_eq!(
            address_from_word(&bytes, 0).unwrap(),
            format!("0x{}", "ab".repeat(20))
        );
    }

    #[test]
    fn test_encode_address_padding() {
        let encoded =
            encode_address("0xDAC17F958D2ee523a2206206994597C13D831ec7").unwrap();
        assert_eq!(encoded.len(), 64);
        assert!(encoded.starts_with("000000000000000000000000dac17f"));
        assert!(encode_address("0x1234").is_err());
    }
}
