//! Integration tests for the JSON-RPC backed proxy primitives.
//!
//! A minimal JSON-RPC node is served over a local TCP socket so that
//! `RpcProxyBackend`, `RpcClient` and `RpcSigner` run their real request code.
//! Run with: cargo test --test rpc_backend_test

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use alloy_core::{
    primitives::{Address, B256, Bytes, Signature, U256, address},
    sol_types::SolValue,
};
use anyhow::Result;
use proxup_deploy::{
    BytecodeHistoryStore, ChainSigner, ContractArtifact, ContractCall, DeployError, DeployOptions,
    MemoryHistoryStore, ProxyBackend, RetryPolicy, RpcClient, RpcProxyBackend, RpcSigner,
    SafeServiceClient, StorageLayoutValidator, TransactionRouter, TxReceipt,
    rpc::IMPLEMENTATION_SLOT,
};
use serde_json::{Value, json};
use tempdir::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use url::Url;

const STUB: &str = "Stub_Contract";
const STUB_CODE: [u8; 4] = [0x60, 0x80, 0x60, 0x40];
const PROXY_CODE: [u8; 3] = [0x60, 0x80, 0xff];
const SENDER: Address = address!("0xB8c77482e45F1F44dE1745F52C74426C631bDD52");

// -------------
// | Stub node |
// -------------

#[derive(Default)]
struct NodeState {
    code: HashMap<Address, Bytes>,
    storage: HashMap<(Address, B256), B256>,
    /// Answer to `proxiableUUID()`; the call reverts when unset.
    proxiable_uuid: Option<B256>,
    methods: Vec<String>,
}

impl NodeState {
    fn handle(&mut self, method: &str, params: &[Value]) -> Result<Value, String> {
        self.methods.push(method.to_string());
        let param = |i: usize| params.get(i).cloned().unwrap_or(Value::Null);
        let address = |i: usize| {
            serde_json::from_value::<Address>(param(i)).map_err(|e| format!("bad address: {e}"))
        };

        match method {
            "eth_getCode" => {
                let code = self.code.get(&address(0)?).cloned().unwrap_or_default();
                Ok(json!(code))
            }
            "eth_getStorageAt" => {
                let slot: B256 =
                    serde_json::from_value(param(1)).map_err(|e| format!("bad slot: {e}"))?;
                let word = self
                    .storage
                    .get(&(address(0)?, slot))
                    .copied()
                    .unwrap_or_default();
                Ok(json!(U256::from_be_bytes(word.0)))
            }
            "eth_call" => match self.proxiable_uuid {
                Some(uuid) => Ok(json!(Bytes::from(uuid.abi_encode()))),
                None => Err("execution reverted".to_string()),
            },
            "eth_sendTransaction" => Ok(json!(B256::with_last_byte(self.methods.len() as u8))),
            "eth_getTransactionReceipt" => Ok(Value::Null),
            _ => Err(format!("method {method} not found")),
        }
    }

    fn calls_to(&self, method: &str) -> usize {
        self.methods.iter().filter(|m| *m == method).count()
    }
}

#[derive(Clone, Default)]
struct StubNode(Arc<Mutex<NodeState>>);

impl StubNode {
    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.0.lock().unwrap()
    }

    /// Serve JSON-RPC on an ephemeral local port until the test ends.
    async fn serve(&self) -> Result<Url> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = Url::parse(&format!("http://{}", listener.local_addr()?))?;

        let node = self.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let node = node.clone();
                tokio::spawn(async move {
                    if let Err(e) = node.answer(stream).await {
                        eprintln!("stub node connection failed: {e}");
                    }
                });
            }
        });

        Ok(url)
    }

    async fn answer(&self, mut stream: TcpStream) -> Result<()> {
        let mut buf = Vec::new();
        let header_end = loop {
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await?;
            anyhow::ensure!(n > 0, "connection closed before headers");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
        let content_length: usize = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .map(|len| len.trim().parse())
            .transpose()?
            .unwrap_or(0);

        while buf.len() < header_end + content_length {
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await?;
            anyhow::ensure!(n > 0, "connection closed before body");
            buf.extend_from_slice(&chunk[..n]);
        }

        let request: Value = serde_json::from_slice(&buf[header_end..header_end + content_length])?;
        let method = request["method"].as_str().unwrap_or_default();
        let params = request["params"].as_array().cloned().unwrap_or_default();

        let outcome = self.state().handle(method, &params);
        let reply = match outcome {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": request["id"], "result": result }),
            Err(message) => json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": { "code": -32000, "message": message }
            }),
        };

        let body = reply.to_string();
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

// ---------------
// | Fake signer |
// ---------------

/// Creates contracts straight into the stub node's state.
#[derive(Clone, Default)]
struct FakeSigner {
    node: StubNode,
    deployed: Arc<Mutex<Vec<(Address, Bytes)>>>,
}

impl FakeSigner {
    fn deployed(&self) -> Vec<(Address, Bytes)> {
        self.deployed.lock().unwrap().clone()
    }
}

impl ChainSigner for FakeSigner {
    fn address(&self) -> Address {
        SENDER
    }

    async fn send_transaction(&self, call: &ContractCall) -> Result<TxReceipt, DeployError> {
        Err(DeployError::Reverted {
            tx_hash: B256::ZERO,
            reason: format!("unexpected call to {}", call.abi_fragment),
        })
    }

    async fn deploy_code(&self, init_code: Bytes) -> Result<TxReceipt, DeployError> {
        let mut deployed = self.deployed.lock().unwrap();
        let n = deployed.len() as u64 + 1;
        let address = Address::left_padding_from(&(0x1000 + n).to_be_bytes());

        self.node.state().code.insert(address, init_code.clone());
        deployed.push((address, init_code));

        Ok(TxReceipt {
            tx_hash: B256::with_last_byte(n as u8),
            block_number: Some(n),
            contract_address: Some(address),
            success: true,
        })
    }

    async fn sign_hash(&self, _: B256) -> Result<Option<Signature>, DeployError> {
        Ok(None)
    }
}

// -----------
// | Harness |
// -----------

type TestBackend = RpcProxyBackend<FakeSigner, Arc<MemoryHistoryStore>>;

struct Harness {
    node: StubNode,
    signer: FakeSigner,
    history: Arc<MemoryHistoryStore>,
    backend: TestBackend,
    _artifacts: TempDir,
}

fn write_artifact(dir: &TempDir, name: &str, code: &[u8]) -> Result<()> {
    let dir = dir.path().join(format!("{name}.sol"));
    std::fs::create_dir_all(&dir)?;
    std::fs::write(
        dir.join(format!("{name}.json")),
        json!({ "abi": [], "bytecode": { "object": Bytes::copy_from_slice(code) } }).to_string(),
    )?;
    Ok(())
}

impl Harness {
    async fn new() -> Result<Self> {
        let artifacts = TempDir::new("proxup-rpc-artifacts")?;
        write_artifact(&artifacts, STUB, &STUB_CODE)?;
        write_artifact(&artifacts, "ERC1967Proxy", &PROXY_CODE)?;

        let node = StubNode::default();
        let url = node.serve().await?;

        let signer = FakeSigner {
            node: node.clone(),
            ..Default::default()
        };
        let history = Arc::new(MemoryHistoryStore::new());
        let backend = RpcProxyBackend::new(
            RpcClient::new(url)?,
            signer.clone(),
            history.clone(),
            artifacts.path(),
        );

        Ok(Self {
            node,
            signer,
            history,
            backend,
            _artifacts: artifacts,
        })
    }

    fn stub(&self) -> Result<ContractArtifact> {
        Ok(self.backend.artifact(STUB)?)
    }

    fn point_proxy_at(&self, proxy: Address, implementation: Address) {
        self.node
            .state()
            .storage
            .insert((proxy, IMPLEMENTATION_SLOT), implementation.into_word());
    }
}

// ---------
// | Tests |
// ---------

#[tokio::test]
async fn test_create_proxy_deploys_implementation_then_proxy() -> Result<()> {
    let harness = Harness::new().await?;
    let init_data = Bytes::from_static(&[0x81, 0x29, 0xfc, 0x1c]);

    let proxy = harness
        .backend
        .create_proxy(&harness.stub()?, &init_data, &DeployOptions::default())
        .await?;

    let deployed = harness.signer.deployed();
    assert_eq!(deployed.len(), 2);

    let (implementation, implementation_code) = &deployed[0];
    assert_eq!(*implementation_code, Bytes::from_static(&STUB_CODE));

    let (proxy_address, proxy_code) = &deployed[1];
    assert_eq!(*proxy_address, proxy);
    let mut expected = PROXY_CODE.to_vec();
    expected.extend((*implementation, init_data).abi_encode_params());
    assert_eq!(*proxy_code, Bytes::from(expected));

    let group = harness
        .history
        .find_by_code_hash(harness.stub()?.code_hash(&[]))
        .await?
        .expect("implementation recorded");
    assert!(group.contains(*implementation));
    Ok(())
}

#[tokio::test]
async fn test_second_proxy_reuses_implementation() -> Result<()> {
    let harness = Harness::new().await?;
    let artifact = harness.stub()?;
    let options = DeployOptions::default();

    let first = harness
        .backend
        .create_proxy(&artifact, &Bytes::new(), &options)
        .await?;
    let second = harness
        .backend
        .create_proxy(&artifact, &Bytes::new(), &options)
        .await?;

    assert_ne!(first, second);
    let deployed = harness.signer.deployed();
    assert_eq!(deployed.len(), 3);
    assert!(deployed[2].1.starts_with(&PROXY_CODE));
    assert!(harness.node.state().calls_to("eth_getCode") >= 1);
    Ok(())
}

#[tokio::test]
async fn test_recorded_implementation_without_code_is_skipped() -> Result<()> {
    let harness = Harness::new().await?;
    let artifact = harness.stub()?;
    let ghost = address!("0x000000000000000000000000000000000000dead");
    harness
        .history
        .record_alias(artifact.code_hash(&[]), ghost)
        .await?;

    harness
        .backend
        .create_proxy(&artifact, &Bytes::new(), &DeployOptions::default())
        .await?;

    let deployed = harness.signer.deployed();
    assert_eq!(deployed.len(), 2);
    assert_ne!(deployed[0].0, ghost);
    assert_eq!(deployed[0].1, Bytes::from_static(&STUB_CODE));
    Ok(())
}

#[tokio::test]
async fn test_prepare_upgrade_reads_implementation_slot() -> Result<()> {
    let harness = Harness::new().await?;
    let artifact = harness.stub()?;
    let options = DeployOptions::default();

    let proxy = harness
        .backend
        .create_proxy(&artifact, &Bytes::new(), &options)
        .await?;
    let implementation = harness.signer.deployed()[0].0;
    harness.point_proxy_at(proxy, implementation);

    assert_eq!(
        harness.backend.current_implementation(proxy).await?,
        implementation
    );
    assert_eq!(
        harness
            .backend
            .prepare_upgrade(proxy, &artifact, &options)
            .await?,
        implementation
    );
    assert_eq!(harness.signer.deployed().len(), 2);

    let with_args = DeployOptions {
        constructor_args: U256::from(7).abi_encode().into(),
        ..Default::default()
    };
    let candidate = harness
        .backend
        .prepare_upgrade(proxy, &artifact, &with_args)
        .await?;

    assert_ne!(candidate, implementation);
    let deployed = harness.signer.deployed();
    assert_eq!(deployed.len(), 3);
    assert_eq!(deployed[2].1, artifact.init_code(&with_args.constructor_args));
    Ok(())
}

#[tokio::test]
async fn test_upgrade_target_must_be_proxiable() -> Result<()> {
    let harness = Harness::new().await?;
    let artifact = harness.stub()?;
    let proxy = address!("0x5FbDB2315678afecb367f032d93F642f64180aa3");
    let candidate = address!("0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512");

    harness.node.state().proxiable_uuid = Some(IMPLEMENTATION_SLOT);
    harness
        .backend
        .validate_upgrade(proxy, candidate, &artifact)
        .await?;

    harness.node.state().proxiable_uuid = Some(B256::ZERO);
    let err = harness
        .backend
        .validate_upgrade(proxy, candidate, &artifact)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::StorageLayoutIncompatible { proxy: p, .. } if p == proxy));

    harness.node.state().proxiable_uuid = None;
    let err = harness
        .backend
        .validate_upgrade(proxy, candidate, &artifact)
        .await
        .unwrap_err();
    assert!(
        matches!(err, DeployError::StorageLayoutIncompatible { ref reason, .. } if reason.contains("proxiableUUID"))
    );
    Ok(())
}

#[tokio::test]
async fn test_unmined_transaction_is_not_rebroadcast() -> Result<()> {
    let node = StubNode::default();
    let url = node.serve().await?;
    let rpc = RpcClient::new(url)?.with_receipt_timeout(Duration::ZERO);
    let signer = RpcSigner::new(rpc, SENDER);

    let router = TransactionRouter::<SafeServiceClient>::direct(RetryPolicy::transient(
        3,
        Duration::from_millis(10),
    ));
    let call = ContractCall::upgrade_to_and_call(
        address!("0x5FbDB2315678afecb367f032d93F642f64180aa3"),
        address!("0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512"),
        Bytes::new(),
    );

    let err = router.send(&call, &signer).await.unwrap_err();

    assert!(matches!(err, DeployError::ReceiptTimeout { .. }));
    assert!(!err.is_transient());
    assert_eq!(node.state().calls_to("eth_sendTransaction"), 1);
    Ok(())
}
