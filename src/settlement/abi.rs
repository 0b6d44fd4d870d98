//! Minimal ERC-20 call encoding and JSON-RPC quantity helpers.

use super::SettlementError;

/// `transfer(address,uint256)`
pub const TRANSFER_SELECTOR: &str = "a9059cbb";
/// `balanceOf(address)`
pub const BALANCE_OF_SELECTOR: &str = "70a08231";

/// Left-pad a 20-byte address into a 32-byte ABI word.
pub fn encode_address(address: &str) -> Result<String, SettlementError> {
    let stripped = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .unwrap_or(address);
    let bytes = hex::decode(stripped)
        .map_err(|e| SettlementError::Unsupported(format!("invalid address {}: {}", address, e)))?;
    if bytes.len() != 20 {
        return Err(SettlementError::Unsupported(format!(
            "address {} is {} bytes, expected 20",
            address,
            bytes.len()
        )));
    }
    Ok(format!("{:0>64}", hex::encode(bytes)))
}

pub fn encode_uint(value: u128) -> String {
    format!("{:064x}", value)
}

/// Calldata for `transfer(to, amount)`.
pub fn transfer_calldata(to: &str, amount: u128) -> Result<String, SettlementError> {
    Ok(format!(
        "0x{}{}{}",
        TRANSFER_SELECTOR,
        encode_address(to)?,
        encode_uint(amount)
    ))
}

/// Calldata for `balanceOf(owner)`.
pub fn balance_of_calldata(owner: &str) -> Result<String, SettlementError> {
    Ok(format!("0x{}{}", BALANCE_OF_SELECTOR, encode_address(owner)?))
}

/// Parse a hex quantity or a 32-byte ABI word into a `u128`.
///
/// Values wider than 128 bits are rejected.
pub fn parse_quantity(raw: &str) -> Result<u128, SettlementError> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw).trim_start_matches('0');
    if digits.is_empty() {
        return Ok(0);
    }
    if digits.len() > 32 {
        return Err(SettlementError::ParseError(format!(
            "quantity {} exceeds 128 bits",
            raw
        )));
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| SettlementError::ParseError(format!("invalid quantity {}: {}", raw, e)))
}

/// Format a JSON-RPC quantity (`0x`-prefixed, no leading zeros).
pub fn to_quantity(value: u128) -> String {
    format!("0x{:x}", value)
}
