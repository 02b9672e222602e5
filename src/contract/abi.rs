//! ABI encoding for the task contract
//!
//! Canonical interface:
//!
//! ```text
//! getMyTask() view returns ((uint256 id, string taskTitle, string taskText, bool isDeleted)[])
//! addTask(string taskText, string taskTitle, bool isDeleted)
//! deleteTask(uint256 id)
//! deposit() payable
//! withdraw(uint256 amount)
//! ```

use ethers_core::abi::{decode, encode, ParamType, Token};
use ethers_core::types::{Bytes, U256};
use ethers_core::utils::id;
use serde::{Deserialize, Serialize};

use super::ContractError;

pub const GET_MY_TASK: &str = "getMyTask()";
pub const ADD_TASK: &str = "addTask(string,string,bool)";
pub const DELETE_TASK: &str = "deleteTask(uint256)";
pub const DEPOSIT: &str = "deposit()";
pub const WITHDRAW: &str = "withdraw(uint256)";

/// Task record exactly as the contract returns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTask {
    pub id: U256,
    pub task_title: String,
    pub task_text: String,
    pub is_deleted: bool,
}

fn calldata(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(encode(args));
    data.into()
}

pub fn get_my_task() -> Bytes {
    calldata(GET_MY_TASK, &[])
}

/// The contract takes the text first and the title second
pub fn add_task(title: &str, text: &str) -> Bytes {
    calldata(
        ADD_TASK,
        &[
            Token::String(text.to_string()),
            Token::String(title.to_string()),
            Token::Bool(false),
        ],
    )
}

pub fn delete_task(task_id: u64) -> Bytes {
    calldata(DELETE_TASK, &[Token::Uint(U256::from(task_id))])
}

pub fn deposit() -> Bytes {
    calldata(DEPOSIT, &[])
}

pub fn withdraw(amount: U256) -> Bytes {
    calldata(WITHDRAW, &[Token::Uint(amount)])
}

fn task_tuple() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Uint(256),
        ParamType::String,
        ParamType::String,
        ParamType::Bool,
    ])
}

/// Decode the return data of `getMyTask()`
pub fn decode_tasks(data: &[u8]) -> Result<Vec<RawTask>, ContractError> {
    // An account with no storage slot yet may come back empty
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let mut tokens = decode(&[ParamType::Array(Box::new(task_tuple()))], data)?;
    let items = tokens
        .pop()
        .and_then(Token::into_array)
        .ok_or_else(|| ContractError::Decode("expected task array".to_string()))?;

    items.into_iter().map(decode_task).collect()
}

fn decode_task(token: Token) -> Result<RawTask, ContractError> {
    let bad = || ContractError::Decode("malformed task tuple".to_string());

    let mut fields = token.into_tuple().ok_or_else(bad)?.into_iter();
    let id = fields.next().and_then(Token::into_uint).ok_or_else(bad)?;
    let task_title = fields.next().and_then(Token::into_string).ok_or_else(bad)?;
    let task_text = fields.next().and_then(Token::into_string).ok_or_else(bad)?;
    let is_deleted = fields.next().and_then(Token::into_bool).ok_or_else(bad)?;

    Ok(RawTask {
        id,
        task_title,
        task_text,
        is_deleted,
    })
}
