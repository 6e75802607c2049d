// SPDX-License-Identifier: Apache-2.0

//! Transport boundary between the host driver and a Ledger device
//!
//! A transport moves exactly one already-framed APDU to the device and returns
//! the matching raw answer, status word included. Splitting oversized payloads,
//! timeouts and status-word interpretation all happen above this layer.

use std::ops::Deref;
use std::sync::Arc;

pub use async_trait::async_trait;
pub use ledger_apdu::{
    APDUAnswer, APDUAnswerError, APDUCommand, APDUCommandError, APDUErrorCode, MAX_DATA_LEN,
};

/// Use to talk to the ledger device
#[async_trait]
pub trait Exchange {
    /// Error defined by Transport used
    type Error;

    /// The concrete type containing the APDUAnswer
    type AnswerType: Deref<Target = [u8]> + Send;

    /// Send a single command frame and retrieve the answer or a transport error
    async fn exchange<I>(
        &self,
        command: &APDUCommand<I>,
    ) -> Result<APDUAnswer<Self::AnswerType>, Self::Error>
    where
        I: Deref<Target = [u8]> + Send + Sync;
}

#[async_trait]
impl<T> Exchange for Arc<T>
where
    T: Exchange + Send + Sync,
{
    type Error = T::Error;
    type AnswerType = T::AnswerType;

    async fn exchange<I>(
        &self,
        command: &APDUCommand<I>,
    ) -> Result<APDUAnswer<Self::AnswerType>, Self::Error>
    where
        I: Deref<Target = [u8]> + Send + Sync,
    {
        (**self).exchange(command).await
    }
}
