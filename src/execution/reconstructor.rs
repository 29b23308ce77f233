use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::transaction::eip2930::AccessList;
use ethers::types::{
    Bytes, Eip1559TransactionRequest, Eip2930TransactionRequest, Signature, TransactionRequest, U256, U64,
};
use tracing::{debug, warn};

use crate::constants::{ACCESS_LIST_TX_TYPE, DYNAMIC_FEE_TX_TYPE, LEGACY_TX_TYPE};
use crate::types::{PendingTxRecord, RacerError, RacerResult, RawTransaction};

/// 수수료 모델
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeeModel {
    Legacy { gas_price: U256 },
    AccessList { gas_price: U256 },
    DynamicFee { max_fee_per_gas: U256, max_priority_fee_per_gas: U256 },
}

/// 펜딩 트랜잭션 레코드 -> 서명된 raw 트랜잭션 재구성기
///
/// 노드가 돌려준 JSON 레코드에서 블록 위치/발신자/해시 같은 메타데이터를 걷어내고
/// 서명 페이로드 필드만으로 정규 직렬화를 다시 만든다. 결과의 keccak256 은
/// 레코드의 해시와 같아야 한다.
#[derive(Debug, Clone)]
pub struct RawTransactionReconstructor {
    verify_hash: bool,
}

impl Default for RawTransactionReconstructor {
    fn default() -> Self {
        Self { verify_hash: true }
    }
}

impl RawTransactionReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 해시 검증 비활성화 (테스트/디버깅용)
    pub fn without_hash_check() -> Self {
        Self { verify_hash: false }
    }

    /// 레코드를 서명된 raw 바이트로 재구성
    pub fn reconstruct(&self, record: &PendingTxRecord) -> RacerResult<RawTransaction> {
        // 노드가 raw 바이트를 직접 준 경우 재인코딩 없이 검증만 한다
        if let Some(raw) = &record.raw {
            let raw = RawTransaction::from(raw.clone());
            self.verify(record, &raw)?;
            debug!("노드 제공 raw 트랜잭션 사용: {:?}", record.hash);
            return Ok(raw);
        }

        let signature = signature_of(record)?;
        let typed = unsigned_transaction(record)?;
        let raw = RawTransaction::new(typed.rlp_signed(&signature));
        self.verify(record, &raw)?;

        debug!(
            "🔧 raw 트랜잭션 재구성 완료: {:?} ({} bytes)",
            record.hash,
            raw.len()
        );
        Ok(raw)
    }

    fn verify(&self, record: &PendingTxRecord, raw: &RawTransaction) -> RacerResult<()> {
        if !self.verify_hash {
            return Ok(());
        }
        let actual = raw.hash();
        if actual != record.hash {
            warn!("❌ 재구성 해시 불일치: expected={:?} actual={:?}", record.hash, actual);
            return Err(RacerError::Encoding(format!(
                "reconstructed hash {:?} does not match {:?}",
                actual, record.hash
            )));
        }
        Ok(())
    }
}

fn required<T: Clone>(record: &PendingTxRecord, value: &Option<T>, field: &'static str) -> RacerResult<T> {
    value
        .clone()
        .ok_or(RacerError::IncompleteRecord { hash: record.hash, field })
}

fn signature_of(record: &PendingTxRecord) -> RacerResult<Signature> {
    let v = required(record, &record.v, "v")?;
    let r = required(record, &record.r, "r")?;
    let s = required(record, &record.s, "s")?;
    Ok(Signature { r, s, v: v.as_u64() })
}

fn chain_id_of(record: &PendingTxRecord) -> RacerResult<U64> {
    let chain_id = required(record, &record.chain_id, "chainId")?;
    if chain_id > U256::from(u64::MAX) {
        return Err(RacerError::Encoding(format!("chain id {} out of range", chain_id)));
    }
    Ok(U64::from(chain_id.as_u64()))
}

/// 선언된 타입과 존재하는 가스 필드로 수수료 모델 결정
///
/// - type 2: maxFeePerGas/maxPriorityFeePerGas 필수, gasPrice 는 노드가 붙인 유효 가격이라 무시
/// - type 0/1: gasPrice 필수, 수수료 시장 필드가 있으면 인코딩 불가
/// - 타입 없음: 존재하는 필드로 추론, 둘 다 있으면 모호하므로 인코딩 불가
fn fee_model(record: &PendingTxRecord) -> RacerResult<FeeModel> {
    let has_market_fields = record.max_fee_per_gas.is_some() || record.max_priority_fee_per_gas.is_some();

    let dynamic = |record: &PendingTxRecord| -> RacerResult<FeeModel> {
        Ok(FeeModel::DynamicFee {
            max_fee_per_gas: required(record, &record.max_fee_per_gas, "maxFeePerGas")?,
            max_priority_fee_per_gas: required(record, &record.max_priority_fee_per_gas, "maxPriorityFeePerGas")?,
        })
    };

    match record.transaction_type.map(|t| t.as_u64()) {
        Some(DYNAMIC_FEE_TX_TYPE) => dynamic(record),
        Some(declared @ (LEGACY_TX_TYPE | ACCESS_LIST_TX_TYPE)) => {
            if has_market_fields {
                return Err(RacerError::Encoding(format!(
                    "type {} transaction carries fee-market fields",
                    declared
                )));
            }
            let gas_price = required(record, &record.gas_price, "gasPrice")?;
            Ok(if declared == LEGACY_TX_TYPE {
                FeeModel::Legacy { gas_price }
            } else {
                FeeModel::AccessList { gas_price }
            })
        }
        Some(other) => Err(RacerError::Encoding(format!("unsupported transaction type {}", other))),
        None => match (record.gas_price, has_market_fields) {
            (Some(_), true) => Err(RacerError::Encoding(
                "untyped transaction carries both gasPrice and fee-market fields".to_string(),
            )),
            (Some(gas_price), false) => Ok(FeeModel::Legacy { gas_price }),
            (None, true) => dynamic(record),
            (None, false) => Err(RacerError::Encoding("no fee fields present".to_string())),
        },
    }
}

/// 서명 페이로드 필드만으로 서명 전 트랜잭션 구성
fn unsigned_transaction(record: &PendingTxRecord) -> RacerResult<TypedTransaction> {
    let nonce = required(record, &record.nonce, "nonce")?;
    let gas = required(record, &record.gas, "gas")?;
    let value = required(record, &record.value, "value")?;
    let data: Bytes = required(record, &record.input, "input")?;
    let access_list = record.access_list.clone().unwrap_or_else(AccessList::default);

    let typed = match fee_model(record)? {
        FeeModel::Legacy { gas_price } => {
            let mut request = TransactionRequest::new()
                .nonce(nonce)
                .gas(gas)
                .gas_price(gas_price)
                .value(value)
                .data(data);
            if let Some(to) = record.to {
                request = request.to(to);
            }
            TypedTransaction::Legacy(request)
        }
        FeeModel::AccessList { gas_price } => {
            let mut request = TransactionRequest::new()
                .nonce(nonce)
                .gas(gas)
                .gas_price(gas_price)
                .value(value)
                .data(data)
                .chain_id(chain_id_of(record)?);
            if let Some(to) = record.to {
                request = request.to(to);
            }
            TypedTransaction::Eip2930(Eip2930TransactionRequest::new(request, access_list))
        }
        FeeModel::DynamicFee { max_fee_per_gas, max_priority_fee_per_gas } => {
            let mut request = Eip1559TransactionRequest::new()
                .nonce(nonce)
                .gas(gas)
                .max_fee_per_gas(max_fee_per_gas)
                .max_priority_fee_per_gas(max_priority_fee_per_gas)
                .value(value)
                .data(data)
                .access_list(access_list)
                .chain_id(chain_id_of(record)?);
            if let Some(to) = record.to {
                request = request.to(to);
            }
            TypedTransaction::Eip1559(request)
        }
    };

    Ok(typed)
}
