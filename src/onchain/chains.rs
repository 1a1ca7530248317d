//! Supported chains and their V2-style DEX metadata.
//!
//! RPC endpoints are public defaults, overridable per chain through the
//! environment. Addresses are stored lowercased; comparisons always go
//! through [`normalize_address`].

/// Uniswap-V2-compatible deployment on one chain.
#[derive(Debug, Clone, Copy)]
pub struct ChainConfig {
    pub slug: &'static str,
    pub name: &'static str,
    /// Environment variable that overrides the default RPC URL.
    pub rpc_env: &'static str,
    pub default_rpc: &'static str,
    pub wrapped_native: &'static str,
    pub usdt: &'static str,
    pub usdc: &'static str,
    pub factory: &'static str,
    /// Wrapped-native/USDT pool used to quote native in stable.
    pub native_stable_pool: &'static str,
}

pub const CHAINS: [ChainConfig; 4] = [
    ChainConfig {
        slug: "ethereum",
        name: "Ethereum",
        rpc_env: "ETH_RPC_URL",
        default_rpc: "https://eth.llamarpc.com",
        wrapped_native: "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2",
        usdt: "0xdac17f958d2ee523a2206206994597c13d831ec7",
        usdc: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48",
        factory: "0x5c69bee701ef814a2b6a3edd4b1652cb9cc5aa6f",
        native_stable_pool: "0x0d4a11d5eeaac28ec3f61d100daf4d40471f1852",
    },
    ChainConfig {
        slug: "bsc",
        name: "BNB Smart Chain",
        rpc_env: "BSC_RPC_URL",
        default_rpc: "https://bsc-dataseed.binance.org",
        wrapped_native: "0xbb4cdb9cbd36b01bd1cbaebf2de08d9173bc095c",
        usdt: "0x55d398326f99059ff775485246999027b3197955",
        usdc: "0x8ac76a51cc950d9822d68b83fe1ad97b32cd580d",
        factory: "0xca143ce32fe78f1f7019d7d551a6402fc5350c73",
        native_stable_pool: "0x16b9a82891338f9ba80e2d6970fdda79d1eb0dae",
    },
    ChainConfig {
        slug: "polygon",
        name: "Polygon",
        rpc_env: "POLYGON_RPC_URL",
        default_rpc: "https://polygon-rpc.com",
        wrapped_native: "0x0d500b1d8e8ef31e21c99d1db9a6444d3adf1270",
        usdt: "0xc2132d05d31c914a87c6611c10748aeb04b58e8f",
        usdc: "0x2791bca1f2de4661ed88a30c99a7a9449aa84174",
        factory: "0x5757371414417b8c6caad45baef941abc7d3ab32",
        native_stable_pool: "0x604229c960e5cacf2aaeac8be68ac07ba9df81c3",
    },
    ChainConfig {
        slug: "avalanche",
        name: "Avalanche",
        rpc_env: "AVALANCHE_RPC_URL",
        default_rpc: "https://api.avax.network/ext/bc/C/rpc",
        wrapped_native: "0xb31f66aa3c1e785363f0875a1b74e27b85fd66c7",
        usdt: "0x9702230a8ea53601f5cd2dc00fdbc13d4df4a8c7",
        usdc: "0xb97ef9ef8734c71904d8002f8b6bc66dd9c48a6e",
        factory: "0x9ad6c38be94206ca50bb0d90783181662f0cfa10",
        native_stable_pool: "0xbb4646a764358ee93c2a9c4a147d5aded527ab73",
    },
];

pub fn chain_by_slug(slug: &str) -> Option<&'static ChainConfig> {
    let slug = slug.to_lowercase();
    CHAINS.iter().find(|c| c.slug == slug)
}

impl ChainConfig {
    pub fn rpc_url(&self) -> String {
        std::env::var(self.rpc_env).unwrap_or_else(|_| self.default_rpc.to_string())
    }

    /// Venue identifier pool samples are stored under.
    pub fn venue_id(&self) -> String {
        format!("{}-amm", self.slug)
    }

    pub fn is_stable(&self, address: &str) -> bool {
        let address = normalize_address(address);
        address == self.usdt || address == self.usdc
    }

    pub fn is_wrapped_native(&self, address: &str) -> bool {
        normalize_address(address) == self.wrapped_native
    }
}

/// Hex addresses compare case-insensitively.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// The EVM zero address, returned by `getPair` for missing pools.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_lookup() {
        assert!(chain_by_slug("ethereum").is_some());
        assert!(chain_by_slug("BSC").is_some());
        assert!(chain_by_slug("solana").is_none());
    }

    #[test]
    fn test_stable_detection_case_insensitive() {
        let eth = chain_by_slug("ethereum").unwrap();
        assert!(eth.is_stable("0xDAC17F958D2EE523A2206206994597C13D831EC7"));
        assert!(eth.is_stable(eth.usdc));
        assert!(!eth.is_stable(eth.wrapped_native));
        assert!(eth.is_wrapped_native("0xC02AAA39B223FE8D0A0E5C4F27EAD9083C756CC2"));
    }

    #[test]
    fn test_rpc_env_override() {
        let eth = chain_by_slug("ethereum").unwrap();
        std::env::remove_var(eth.rpc_env);
        assert_eq!(eth.rpc_url(), eth.default_rpc);
        std::env::set_var(eth.rpc_env, "http://localhost:8545");
        assert_eq!(eth.rpc_url(), "http://localhost:8545");
        std::env::remove_var(eth.rpc_env);
    }
}
