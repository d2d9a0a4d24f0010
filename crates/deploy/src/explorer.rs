//! Etherscan-compatible block explorer client.

use std::{
    fmt,
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::primitives::{Address, Bytes};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::{error::DeployError, proxy::SourceBundle};

/// One thing an explorer can verify.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VerificationTarget {
    /// Publish the source of the contract at `address`, built from artifact `contract`.
    Source {
        address: Address,
        contract: String,
        constructor_args: Bytes,
    },
    /// Mark `proxy` as a proxy in front of `implementation`.
    ProxyLink {
        proxy: Address,
        implementation: Address,
    },
}

impl VerificationTarget {
    pub fn address(&self) -> Address {
        match self {
            VerificationTarget::Source { address, .. } => *address,
            VerificationTarget::ProxyLink { proxy, .. } => *proxy,
        }
    }
}

impl fmt::Display for VerificationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationTarget::Source {
                address, contract, ..
            } => write!(f, "source of {contract} at {address}"),
            VerificationTarget::ProxyLink {
                proxy,
                implementation,
            } => write!(f, "proxy {proxy} -> {implementation}"),
        }
    }
}

/// Source verification backend.
pub trait ExplorerApi: Send + Sync {
    fn is_verified(
        &self,
        target: &VerificationTarget,
    ) -> impl Future<Output = Result<bool, DeployError>> + Send;

    /// Submit `target`. Completion is observed through [`ExplorerApi::is_verified`].
    fn verify(
        &self,
        target: &VerificationTarget,
    ) -> impl Future<Output = Result<(), DeployError>> + Send;
}

/// Envelope of every Etherscan API response.
#[derive(Debug, Deserialize)]
struct EtherscanResponse {
    status: String,
    #[serde(default)]
    message: String,
    result: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SourceCodeEntry {
    #[serde(default)]
    source_code: String,
    #[serde(default)]
    proxy: String,
    #[serde(default)]
    implementation: String,
}

impl SourceCodeEntry {
    fn satisfies(&self, target: &VerificationTarget) -> bool {
        match target {
            VerificationTarget::Source { .. } => !self.source_code.is_empty(),
            VerificationTarget::ProxyLink { implementation, .. } => {
                self.proxy == "1"
                    && self
                        .implementation
                        .parse::<Address>()
                        .is_ok_and(|linked| linked == *implementation)
            }
        }
    }
}

/// Client for the Etherscan v2 multichain API.
#[derive(Debug, Clone)]
pub struct EtherscanClient {
    client: reqwest::Client,
    api_url: Url,
    api_key: String,
    chain_id: u64,
    artifacts_dir: PathBuf,
}

impl EtherscanClient {
    pub fn new(api_url: Url, api_key: impl Into<String>, chain_id: u64) -> Result<Self, DeployError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DeployError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url,
            api_key: api_key.into(),
            chain_id,
            artifacts_dir: PathBuf::from("out"),
        })
    }

    /// Foundry output directory holding artifacts and build info.
    pub fn with_artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = dir.into();
        self
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    fn url(&self, action: &str) -> Url {
        let mut url = self.api_url.clone();
        url.query_pairs_mut()
            .append_pair("chainid", &self.chain_id.to_string())
            .append_pair("module", "contract")
            .append_pair("action", action)
            .append_pair("apikey", &self.api_key);
        url
    }

    async fn request(&self, request: reqwest::RequestBuilder) -> Result<Value, DeployError> {
        let response: EtherscanResponse = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DeployError::from_http(e, DeployError::Explorer))?
            .json()
            .await
            .map_err(|e| DeployError::Explorer(format!("invalid response: {e}")))?;

        check_status(response)
    }
}

fn check_status(response: EtherscanResponse) -> Result<Value, DeployError> {
    if response.status == "1" {
        return Ok(response.result);
    }

    let detail = response
        .result
        .as_str()
        .map(str::to_string)
        .unwrap_or(response.message);

    if detail.to_lowercase().contains("rate limit") {
        Err(DeployError::Network(detail))
    } else {
        Err(DeployError::Explorer(detail))
    }
}

fn parse_status(result: Value, target: &VerificationTarget) -> Result<bool, DeployError> {
    let entries: Vec<SourceCodeEntry> = serde_json::from_value(result)
        .map_err(|e| DeployError::Explorer(format!("unexpected getsourcecode result: {e}")))?;

    Ok(entries.iter().any(|e| e.satisfies(target)))
}

/// Form of a `verifysourcecode` submission.
fn source_form(
    address: Address,
    bundle: &SourceBundle,
    constructor_args: &Bytes,
) -> Result<Vec<(&'static str, String)>, DeployError> {
    let standard_json = serde_json::to_string(&bundle.standard_json)
        .map_err(|e| DeployError::Encoding(format!("failed to serialize compiler input: {e}")))?;

    let mut form = vec![
        ("contractaddress", address.to_checksum(None)),
        ("sourceCode", standard_json),
        ("codeformat", "solidity-standard-json-input".to_string()),
        ("contractname", bundle.contract_path.clone()),
        ("compilerversion", format!("v{}", bundle.compiler_version)),
    ];
    if !constructor_args.is_empty() {
        // Etherscan's spelling.
        form.push(("constructorArguements", hex::encode(constructor_args)));
    }
    Ok(form)
}

impl ExplorerApi for EtherscanClient {
    async fn is_verified(&self, target: &VerificationTarget) -> Result<bool, DeployError> {
        let mut url = self.url("getsourcecode");
        url.query_pairs_mut()
            .append_pair("address", &target.address().to_checksum(None));

        let result = self.request(self.client.get(url)).await?;
        parse_status(result, target)
    }

    async fn verify(&self, target: &VerificationTarget) -> Result<(), DeployError> {
        let (action, form) = match target {
            VerificationTarget::Source {
                address,
                contract,
                constructor_args,
            } => {
                let bundle = SourceBundle::load_foundry(&self.artifacts_dir, contract)?;
                (
                    "verifysourcecode",
                    source_form(*address, &bundle, constructor_args)?,
                )
            }
            VerificationTarget::ProxyLink {
                proxy,
                implementation,
            } => (
                "verifyproxycontract",
                vec![
                    ("address", proxy.to_checksum(None)),
                    ("expectedimplementation", implementation.to_checksum(None)),
                ],
            ),
        };

        let guid = self
            .request(self.client.post(self.url(action)).form(&form))
            .await?;

        tracing::debug!(%target, guid = %guid, "Verification submitted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::primitives::address;

    fn response(json: Value) -> EtherscanResponse {
        serde_json::from_value(json).unwrap()
    }

    const PROXY: Address = address!("0x5FbDB2315678afecb367f032d93F642f64180aa3");
    const IMPL: Address = address!("0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512");

    fn source(address: Address) -> VerificationTarget {
        VerificationTarget::Source {
            address,
            contract: "Stub".to_string(),
            constructor_args: Bytes::new(),
        }
    }

    #[test]
    fn test_source_code_means_verified() {
        let verified = serde_json::json!([{ "SourceCode": "contract Stub {}", "ContractName": "Stub" }]);
        let unverified = serde_json::json!([{ "SourceCode": "", "ABI": "Contract source code not verified" }]);

        assert!(parse_status(verified, &source(IMPL)).unwrap());
        assert!(!parse_status(unverified, &source(IMPL)).unwrap());
    }

    #[test]
    fn test_matched_proxy_source_is_not_a_link() {
        let link = VerificationTarget::ProxyLink {
            proxy: PROXY,
            implementation: IMPL,
        };

        // Proxy bytecode already matched, but not marked as a proxy of IMPL.
        let matched = serde_json::json!([{
            "SourceCode": "contract ERC1967Proxy {}",
            "Proxy": "0",
            "Implementation": ""
        }]);
        assert!(parse_status(matched.clone(), &source(PROXY)).unwrap());
        assert!(!parse_status(matched, &link).unwrap());

        let stale = serde_json::json!([{
            "SourceCode": "contract ERC1967Proxy {}",
            "Proxy": "1",
            "Implementation": "0x0000000000000000000000000000000000000001"
        }]);
        assert!(!parse_status(stale, &link).unwrap());

        let linked = serde_json::json!([{
            "SourceCode": "contract ERC1967Proxy {}",
            "Proxy": "1",
            "Implementation": "0xe7f1725e7734ce288f8367e1bb143e90bb3f0512"
        }]);
        assert!(parse_status(linked, &link).unwrap());
    }

    #[test]
    fn test_source_form() {
        let bundle = SourceBundle {
            contract_path: "src/Stub.sol:Stub".to_string(),
            compiler_version: "0.8.20+commit.a1b79de6".to_string(),
            standard_json: serde_json::json!({ "language": "Solidity", "sources": {} }),
        };

        let form = source_form(IMPL, &bundle, &Bytes::from_static(&[0xab, 0xcd])).unwrap();
        let field = |name: &str| {
            form.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.clone())
        };

        assert_eq!(field("contractname").as_deref(), Some("src/Stub.sol:Stub"));
        assert_eq!(
            field("compilerversion").as_deref(),
            Some("v0.8.20+commit.a1b79de6")
        );
        assert_eq!(field("constructorArguements").as_deref(), Some("abcd"));
        assert_eq!(
            field("codeformat").as_deref(),
            Some("solidity-standard-json-input")
        );

        let form = source_form(IMPL, &bundle, &Bytes::new()).unwrap();
        assert!(form.iter().all(|(key, _)| *key != "constructorArguements"));
    }

    #[test]
    fn test_rate_limit_is_transient() {
        let err = check_status(response(serde_json::json!({
            "status": "0",
            "message": "NOTOK",
            "result": "Max rate limit reached, please use API Key for higher rate limit"
        })))
        .unwrap_err();
        assert!(err.is_transient());

        let err = check_status(response(serde_json::json!({
            "status": "0",
            "message": "NOTOK",
            "result": "Invalid API Key"
        })))
        .unwrap_err();
        assert!(matches!(err, DeployError::Explorer(ref m) if m == "Invalid API Key"));
    }

    #[test]
    fn test_query_parameters() {
        let client = EtherscanClient::new(
            "https://api.etherscan.io/v2/api".parse().unwrap(),
            "KEY",
            11155111,
        )
        .unwrap();

        let url = client.url("getsourcecode");
        let query = url.query().unwrap();
        assert!(query.contains("chainid=11155111"));
        assert!(query.contains("action=getsourcecode"));
        assert!(query.contains("apikey=KEY"));
    }
}
