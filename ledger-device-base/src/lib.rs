// SPDX-License-Identifier: Apache-2.0

//! Device connection and app plumbing shared by Ledger applications
//!
//! [`LedgerDevice`] owns a transport together with the per-exchange timeout
//! chosen when the connection is set up. [`AppExt`] adds what every app needs
//! on top: status-word mapping, chunked exchanges for payloads that do not fit
//! a single APDU frame, and the BOLOS app-info query.

mod errors;

use std::ops::Deref;
use std::str;
use std::time::Duration;

use async_trait::async_trait;
pub use errors::*;
use ledger_transport::{APDUAnswer, APDUCommand, APDUErrorCode, Exchange, MAX_DATA_LEN};
use log::trace;
use serde::{Deserialize, Serialize};

// Ledger generic (non app-specific) APDU constants
const CLA_APP_INFO: u8 = 0xb0;
const INS_APP_INFO: u8 = 0x01;

/// Timeout applied to every frame unless the caller picks another one
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// How P1 varies across the frames of a chunked exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkRule {
    /// `first` on the opening frame, `next` on every following one
    FirstThenNext {
        /// P1 of the opening frame
        first: u8,
        /// P1 of every continuation frame
        next: u8,
    },
    /// `more` on every frame except the final one, which carries `last`
    MoreThenLast {
        /// P1 of every non-final frame
        more: u8,
        /// P1 of the final frame
        last: u8,
    },
}

impl ChunkRule {
    /// P1 for frame `index` out of `count`
    pub fn p1(&self, index: usize, count: usize) -> u8 {
        match *self {
            ChunkRule::FirstThenNext { first, .. } if index == 0 => first,
            ChunkRule::FirstThenNext { next, .. } => next,
            ChunkRule::MoreThenLast { last, .. } if index + 1 == count => last,
            ChunkRule::MoreThenLast { more, .. } => more,
        }
    }
}

/// Which answer payloads a chunked exchange hands back
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseMode {
    /// Only the answer to the final frame carries data
    LastFrame,
    /// Every frame answers with a piece of the result
    Concatenate,
}

/// Header shared by all frames of one chunked instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkedInstruction {
    /// Instruction code
    pub ins: u8,
    /// P2, constant across frames
    pub p2: u8,
    /// P1 convention
    pub rule: ChunkRule,
    /// Answer aggregation
    pub response: ResponseMode,
}

/// Split logical frames so that none exceeds the APDU payload limit
///
/// Frames already within the limit are kept as they are, order is preserved.
pub fn split_frames<I>(frames: I) -> Vec<Vec<u8>>
where
    I: IntoIterator<Item = Vec<u8>>,
{
    let mut out = Vec::new();
    for frame in frames {
        if frame.len() <= MAX_DATA_LEN {
            out.push(frame);
        } else {
            out.extend(frame.chunks(MAX_DATA_LEN).map(|c| c.to_vec()));
        }
    }
    out
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
/// App Information
pub struct AppInfo {
    /// Name of the application
    #[serde(rename(serialize = "appName"))]
    pub app_name: String,
    /// App version
    #[serde(rename(serialize = "appVersion"))]
    pub app_version: String,
    /// Flag value
    #[serde(rename(serialize = "flagsValue"))]
    pub flags_value: u8,
    /// Flag Recovery
    #[serde(rename(serialize = "flagsRecovery"))]
    pub flag_recovery: bool,
    /// Flag Signed MCU code
    #[serde(rename(serialize = "flagsSignedMCUCode"))]
    pub flag_signed_mcu_code: bool,
    /// Flag Onboarded
    #[serde(rename(serialize = "flagsOnboarded"))]
    pub flag_onboarded: bool,
    /// Flag Pin Validated
    #[serde(rename(serialize = "flagsPINValidated"))]
    pub flag_pin_validated: bool,
}

/// A connected device: the transport plus the timeout applied to each frame
#[derive(Debug)]
pub struct LedgerDevice<E> {
    transport: E,
    timeout: Duration,
}

impl<E> LedgerDevice<E> {
    /// Wrap a transport using [`DEFAULT_EXCHANGE_TIMEOUT`]
    pub fn new(transport: E) -> Self {
        Self {
            transport,
            timeout: DEFAULT_EXCHANGE_TIMEOUT,
        }
    }

    /// Override the per-exchange timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Per-exchange timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Get a reference to the underlying transport
    pub fn transport(&self) -> &E {
        &self.transport
    }

    /// Release the underlying transport
    pub fn into_transport(self) -> E {
        self.transport
    }
}

impl<E> LedgerDevice<E>
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    /// Send one frame and wait for its answer, bounded by the device timeout
    ///
    /// The status word is not interpreted here. A timeout is reported as is and
    /// never retried.
    pub async fn exchange<I>(
        &self,
        command: &APDUCommand<I>,
    ) -> Result<APDUAnswer<E::AnswerType>, LedgerAppError<E::Error>>
    where
        I: Deref<Target = [u8]> + Send + Sync,
    {
        if command.data.len() > MAX_DATA_LEN {
            return Err(LedgerAppError::InvalidMessageSize);
        }

        trace!(
            ">> {:02x}{:02x}{:02x}{:02x} {}",
            command.cla,
            command.ins,
            command.p1,
            command.p2,
            hex::encode(&*command.data)
        );

        let answer = tokio::time::timeout(self.timeout, self.transport.exchange(command))
            .await
            .map_err(|_| LedgerAppError::Timeout(self.timeout))??;

        trace!(
            "<< {} {:04x}",
            hex::encode(answer.data()),
            answer.retcode()
        );

        Ok(answer)
    }
}

/// Defines what we can consider an "App"
pub trait App {
    /// App's APDU CLA
    const CLA: u8;
}

#[async_trait]
pub trait AppExt<E>: App
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    /// Check APDU status word. Ok on 0x9000, otherwise map to SDK errors.
    fn handle_response_error(
        response: &APDUAnswer<E::AnswerType>,
    ) -> Result<(), LedgerAppError<E::Error>> {
        match response.error_code() {
            Ok(APDUErrorCode::NoError) => Ok(()),
            Ok(APDUErrorCode::ConditionsOfUseNotSatisfied) => Err(LedgerAppError::UserRejected),
            Ok(APDUErrorCode::IncorrectData) => Err(LedgerAppError::WrongData),
            Ok(
                err @ (APDUErrorCode::SecurityStatusNotSatisfied
                | APDUErrorCode::CommandNotAllowed),
            ) => Err(LedgerAppError::ConditionsNotSatisfied(err as u16)),
            Ok(err) => Err(LedgerAppError::AppSpecific(
                err as u16,
                err.description().to_string(),
            )),
            Err(sw) => Err(LedgerAppError::Unknown(sw)),
        }
    }

    /// Same as `handle_response_error`, but also requires non-empty payload (signature).
    fn handle_response_error_signature(
        response: &APDUAnswer<E::AnswerType>,
    ) -> Result<(), LedgerAppError<E::Error>> {
        Self::handle_response_error(response)?;
        if response.data().is_empty() {
            return Err(LedgerAppError::NoSignature);
        }
        Ok(())
    }

    /// Send a single frame with the app's CLA and check the status word
    async fn send_single<I: Deref<Target = [u8]> + Send + Sync>(
        device: &LedgerDevice<E>,
        command: APDUCommand<I>,
    ) -> Result<APDUAnswer<E::AnswerType>, LedgerAppError<E::Error>> {
        let response = device.exchange(&command).await?;
        Self::handle_response_error(&response)?;
        Ok(response)
    }

    /// Stream logical frames to the device, one APDU each
    ///
    /// Frames larger than an APDU payload are split further. Every answer is
    /// checked and the first failing status word aborts the exchange.
    async fn send_chunks(
        device: &LedgerDevice<E>,
        instruction: ChunkedInstruction,
        frames: Vec<Vec<u8>>,
    ) -> Result<Vec<u8>, LedgerAppError<E::Error>> {
        let frames = split_frames(frames);
        if frames.is_empty() {
            return Err(LedgerAppError::InvalidEmptyMessage);
        }

        let count = frames.len();
        let mut payload = Vec::new();

        for (index, data) in frames.into_iter().enumerate() {
            let command = APDUCommand {
                cla: Self::CLA,
                ins: instruction.ins,
                p1: instruction.rule.p1(index, count),
                p2: instruction.p2,
                data,
            };

            let response = device.exchange(&command).await?;
            Self::handle_response_error(&response)?;

            match instruction.response {
                ResponseMode::Concatenate => payload.extend_from_slice(response.data()),
                ResponseMode::LastFrame if index + 1 == count => {
                    payload = response.data().to_vec();
                }
                ResponseMode::LastFrame => {}
            }
        }

        Ok(payload)
    }

    /// Query current app info (name, version, flags) from the device.
    async fn get_app_info(
        device: &LedgerDevice<E>,
    ) -> Result<AppInfo, LedgerAppError<E::Error>> {
        let command = APDUCommand {
            cla: CLA_APP_INFO,
            ins: INS_APP_INFO,
            p1: 0x00,
            p2: 0x00,
            data: Vec::new(),
        };

        let response = device.exchange(&command).await?;
        Self::handle_response_error(&response)?;

        parse_app_info(response.data())
    }
}

impl<T, E> AppExt<E> for T
where
    T: App,
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
}

/// Read a one-byte length prefixed field starting at `*idx`
fn take_lv<'a>(data: &'a [u8], idx: &mut usize) -> Option<&'a [u8]> {
    let len = *data.get(*idx)? as usize;
    let field = data.get(*idx + 1..*idx + 1 + len)?;
    *idx += 1 + len;
    Some(field)
}

fn parse_app_info<E: std::error::Error>(data: &[u8]) -> Result<AppInfo, LedgerAppError<E>> {
    let truncated = || LedgerAppError::MalformedResponse("app info truncated".to_string());

    if *data.first().ok_or_else(truncated)? != 1 {
        return Err(LedgerAppError::InvalidFormatID);
    }

    let mut idx = 1;
    let app_name = take_lv(data, &mut idx).ok_or_else(truncated)?;
    let app_version = take_lv(data, &mut idx).ok_or_else(truncated)?;
    let flags = take_lv(data, &mut idx).ok_or_else(truncated)?;
    let flags_value = flags.first().copied().unwrap_or_default();

    let app_name = str::from_utf8(app_name).map_err(|_e| LedgerAppError::Utf8)?;
    let app_version = str::from_utf8(app_version).map_err(|_e| LedgerAppError::Utf8)?;

    Ok(AppInfo {
        app_name: app_name.to_string(),
        app_version: app_version.to_string(),
        flags_value,
        flag_recovery: (flags_value & 1) != 0,
        flag_signed_mcu_code: (flags_value & 2) != 0,
        flag_onboarded: (flags_value & 4) != 0,
        flag_pin_validated: (flags_value & 128) != 0,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    struct TestApp;

    impl App for TestApp {
        const CLA: u8 = 0xE0;
    }

    /// Records serialized frames and replays queued answers (`9000` when empty)
    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Vec<u8>>>,
        answers: Mutex<VecDeque<Vec<u8>>>,
        delay: Option<Duration>,
    }

    impl Recorder {
        fn with_answers(answers: &[&[u8]]) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            Self {
                answers: Mutex::new(answers.iter().map(|a| a.to_vec()).collect()),
                ..Default::default()
            }
        }

        fn frames(&self) -> Vec<Vec<u8>> {
            self.frames.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Exchange for Recorder {
        type Error = std::io::Error;
        type AnswerType = Vec<u8>;

        async fn exchange<I>(
            &self,
            command: &APDUCommand<I>,
        ) -> Result<APDUAnswer<Self::AnswerType>, Self::Error>
        where
            I: Deref<Target = [u8]> + Send + Sync,
        {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let frame = command
                .serialize()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
            self.frames.lock().unwrap().push(frame);
            let answer = self
                .answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![0x90, 0x00]);
            APDUAnswer::from_answer(answer)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
        }
    }

    #[test]
    fn chunk_rule_first_then_next() {
        let rule = ChunkRule::FirstThenNext {
            first: 0x00,
            next: 0x80,
        };
        assert_eq!(rule.p1(0, 3), 0x00);
        assert_eq!(rule.p1(1, 3), 0x80);
        assert_eq!(rule.p1(2, 3), 0x80);
    }

    #[test]
    fn chunk_rule_more_then_last() {
        let rule = ChunkRule::MoreThenLast {
            more: 0x00,
            last: 0x80,
        };
        assert_eq!(rule.p1(0, 3), 0x00);
        assert_eq!(rule.p1(1, 3), 0x00);
        assert_eq!(rule.p1(2, 3), 0x80);
        assert_eq!(rule.p1(0, 1), 0x80);
    }

    #[test]
    fn split_frames_respects_limit() {
        let frames = split_frames(vec![vec![1; 10], vec![2; 600], vec![]]);
        let lens: Vec<usize> = frames.iter().map(|f| f.len()).collect();
        assert_eq!(lens, vec![10, 255, 255, 90, 0]);
    }

    #[tokio::test]
    async fn send_chunks_marks_last_frame() {
        let device = LedgerDevice::new(Recorder::with_answers(&[
            &[0x90, 0x00],
            &[0x90, 0x00],
            &[0x00, 0x00, 0x90, 0x00],
        ]));
        let instruction = ChunkedInstruction {
            ins: 0x4A,
            p2: 0x00,
            rule: ChunkRule::MoreThenLast {
                more: 0x00,
                last: 0x80,
            },
            response: ResponseMode::LastFrame,
        };

        let payload = <TestApp as AppExt<Recorder>>::send_chunks(
            &device,
            instruction,
            vec![vec![1; 50], vec![2; 50], vec![3; 7]],
        )
        .await
        .unwrap();

        assert_eq!(payload, vec![0x00, 0x00]);
        let frames = device.transport().frames();
        let p1s: Vec<u8> = frames.iter().map(|f| f[2]).collect();
        assert_eq!(p1s, vec![0x00, 0x00, 0x80]);
        assert!(frames.iter().all(|f| f[0] == 0xE0 && f[1] == 0x4A));
    }

    #[tokio::test]
    async fn send_chunks_concatenates_answers() {
        let device = LedgerDevice::new(Recorder::with_answers(&[
            &[0xAA, 0x90, 0x00],
            &[0xBB, 0xCC, 0x90, 0x00],
        ]));
        let instruction = ChunkedInstruction {
            ins: 0x10,
            p2: 0x00,
            rule: ChunkRule::FirstThenNext {
                first: 0x00,
                next: 0x80,
            },
            response: ResponseMode::Concatenate,
        };

        let payload =
            <TestApp as AppExt<Recorder>>::send_chunks(&device, instruction, vec![vec![0; 300]])
                .await
                .unwrap();

        assert_eq!(payload, vec![0xAA, 0xBB, 0xCC]);
        assert_eq!(device.transport().frames().len(), 2);
    }

    #[tokio::test]
    async fn send_chunks_stops_on_error() {
        let device = LedgerDevice::new(Recorder::with_answers(&[&[0x90, 0x00], &[0x6A, 0x80]]));
        let instruction = ChunkedInstruction {
            ins: 0x42,
            p2: 0x00,
            rule: ChunkRule::FirstThenNext {
                first: 0x00,
                next: 0x80,
            },
            response: ResponseMode::LastFrame,
        };

        let err = <TestApp as AppExt<Recorder>>::send_chunks(
            &device,
            instruction,
            vec![vec![1], vec![2], vec![3]],
        )
        .await
        .unwrap_err();

        assert!(matches!(err, LedgerAppError::WrongData));
        assert_eq!(device.transport().frames().len(), 2);
    }

    #[tokio::test]
    async fn send_chunks_rejects_empty_message() {
        let device = LedgerDevice::new(Recorder::default());
        let instruction = ChunkedInstruction {
            ins: 0x42,
            p2: 0x00,
            rule: ChunkRule::FirstThenNext {
                first: 0x00,
                next: 0x80,
            },
            response: ResponseMode::LastFrame,
        };

        let err = <TestApp as AppExt<Recorder>>::send_chunks(&device, instruction, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerAppError::InvalidEmptyMessage));
    }

    #[tokio::test]
    async fn status_words_map_to_errors() {
        let device = LedgerDevice::new(Recorder::with_answers(&[
            &[0x69, 0x85],
            &[0x69, 0x82],
            &[0x6D, 0x00],
            &[0x12, 0x34],
        ]));
        let command = || APDUCommand {
            cla: 0xE0,
            ins: 0x40,
            p1: 0x00,
            p2: 0x00,
            data: Vec::new(),
        };

        let rejected = <TestApp as AppExt<Recorder>>::send_single(&device, command())
            .await
            .unwrap_err();
        assert!(matches!(rejected, LedgerAppError::UserRejected));

        let locked = <TestApp as AppExt<Recorder>>::send_single(&device, command())
            .await
            .unwrap_err();
        assert!(matches!(locked, LedgerAppError::ConditionsNotSatisfied(0x6982)));

        let unsupported = <TestApp as AppExt<Recorder>>::send_single(&device, command())
            .await
            .unwrap_err();
        assert_eq!(unsupported.status_word(), Some(0x6D00));

        let unknown = <TestApp as AppExt<Recorder>>::send_single(&device, command())
            .await
            .unwrap_err();
        assert!(matches!(unknown, LedgerAppError::Unknown(0x1234)));
    }

    #[tokio::test(start_paused = true)]
    async fn exchange_times_out_without_retry() {
        let transport = Recorder {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let device = LedgerDevice::new(transport).with_timeout(Duration::from_millis(100));

        let command = APDUCommand {
            cla: 0xE0,
            ins: 0x40,
            p1: 0x00,
            p2: 0x00,
            data: Vec::new(),
        };
        let err = device.exchange(&command).await.unwrap_err();

        assert!(matches!(err, LedgerAppError::Timeout(d) if d == Duration::from_millis(100)));
        assert!(device.transport().frames().is_empty());
    }

    #[test]
    fn parse_app_info_response() {
        let mut data = vec![0x01];
        data.push(7);
        data.extend_from_slice(b"Bitcoin");
        data.push(5);
        data.extend_from_slice(b"2.1.0");
        data.push(1);
        data.push(0x84);

        let info = parse_app_info::<std::io::Error>(&data).unwrap();
        assert_eq!(info.app_name, "Bitcoin");
        assert_eq!(info.app_version, "2.1.0");
        assert!(info.flag_onboarded);
        assert!(info.flag_pin_validated);
        assert!(!info.flag_recovery);
    }

    #[test]
    fn parse_app_info_truncated() {
        let data = vec![0x01, 0x07, b'B', b't'];
        assert!(matches!(
            parse_app_info::<std::io::Error>(&data),
            Err(LedgerAppError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_app_info::<std::io::Error>(&[0x02]),
            Err(LedgerAppError::InvalidFormatID)
        ));
    }
}
