use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("meet io related error")]
    Io(#[from] io::Error),
    #[error("message encode/decode failed")]
    Codec(#[from] bincode::Error),
}
