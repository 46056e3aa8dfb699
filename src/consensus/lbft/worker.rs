// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

use super::{engine::LbftCore, instance::BatchOwner};
use crate::{
    base::schema::Transaction,
    channel::{RequestReceiver, RequestSender, Sender},
    consensus::{BatchOutcome, Stack},
    Result,
};
use async_std::task::{self, Context, Poll};
use futures::{future, prelude::*};
use std::time::{Duration, Instant};

/// Upper bound of the idle sleep.
const MAX_WAIT: Duration = Duration::from_millis(50);

const MIN_WAIT: Duration = Duration::from_millis(1);

/// Worker inputs.
pub enum Request {
    /// Raw payload received from a replica.
    Consensus(Vec<u8>),
    /// Batch to propose, the outcome goes to the response channel.
    Submit(Vec<Transaction>),
    Stop,
}

pub type LbftRequestSender = RequestSender<Request, BatchOutcome>;

pub type LbftRequestReceiver = RequestReceiver<Request, BatchOutcome>;

pub struct LbftWorker<S: Stack> {
    core: LbftCore<S>,
    rx_chan: LbftRequestReceiver,
}

impl<S: Stack> LbftWorker<S> {
    pub fn new(core: LbftCore<S>, rx_chan: LbftRequestReceiver) -> Self {
        LbftWorker { core, rx_chan }
    }

    fn handle_request(&mut self, req: Request, res_chan: Sender<BatchOutcome>) -> Result<()> {
        let now = Instant::now();
        match req {
            Request::Consensus(buf) => self.core.recv(&buf, now),
            Request::Submit(txs) => self
                .core
                .submit(txs, Some(BatchOwner::Caller(res_chan)), now),
            Request::Stop => Ok(()),
        }
    }

    fn next_wait(&self) -> Duration {
        self.core
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(MAX_WAIT)
            .clamp(MIN_WAIT, MAX_WAIT)
    }

    /// Consensus worker asynchronous task.
    /// Ends on `Stop`, on input channel close or on a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        self.core.start(Instant::now());
        let mut sleep = Box::pin(task::sleep(self.next_wait()));

        let future = future::poll_fn(move |cx: &mut Context<'_>| -> Poll<Result<()>> {
            while sleep.poll_unpin(cx).is_ready() {
                if let Err(err) = self.core.tick(Instant::now()) {
                    if err.is_fatal() {
                        return Poll::Ready(Err(err));
                    }
                    warn!("[lbft] tick: {}", err);
                }
                sleep = Box::pin(task::sleep(self.next_wait()));
            }

            let mut handled = false;
            loop {
                match self.rx_chan.poll_next_unpin(cx) {
                    Poll::Ready(Some((Request::Stop, _))) => return Poll::Ready(Ok(())),
                    Poll::Ready(Some((req, res_chan))) => {
                        handled = true;
                        if let Err(err) = self.handle_request(req, res_chan) {
                            if err.is_fatal() {
                                return Poll::Ready(Err(err));
                            }
                            warn!("[lbft] request: {}", err);
                        }
                    }
                    Poll::Ready(None) => return Poll::Ready(Ok(())),
                    Poll::Pending => break,
                }
            }

            // New timers may be due before the pending sleep.
            if handled {
                sleep = Box::pin(task::sleep(self.next_wait()));
                if sleep.poll_unpin(cx).is_ready() {
                    cx.waker().wake_by_ref();
                }
            }
            Poll::Pending
        });

        future.await
    }

    /// Consensus worker synchronous task.
    /// A fatal error terminates the process.
    pub fn run_sync(&mut self) {
        if let Err(err) = task::block_on(self.run()) {
            error!("[lbft] halted: {}", err.to_string_full());
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::{schema::tests::chain, Context as NodeContext},
        channel::{bounded_channel, confirmed_channel},
        consensus::{lbft::LbftOptions, MockStack},
        ledger::BlockchainInfo,
    };
    use std::sync::Arc;

    fn create_worker() -> (LbftWorker<MockStack>, LbftRequestSender) {
        let mut stack = MockStack::new();
        stack
            .expect_blockchain_info()
            .returning(BlockchainInfo::default);
        let options = LbftOptions {
            id: "00:a".to_string(),
            chain: chain("00"),
            ..Default::default()
        };
        let (broadcast_tx, _) = bounded_channel(10);
        let (output_tx, _) = bounded_channel(10);
        let core = LbftCore::new(
            options,
            NodeContext::default(),
            Arc::new(stack),
            broadcast_tx,
            output_tx,
        );
        let (tx_chan, rx_chan) = confirmed_channel();
        (LbftWorker::new(core, rx_chan), tx_chan)
    }

    #[test]
    fn stops_on_request() {
        let (mut worker, tx_chan) = create_worker();
        tx_chan.send_sync(Request::Consensus(vec![0xc1])).unwrap();
        tx_chan.send_sync(Request::Stop).unwrap();

        let result = task::block_on(worker.run());

        assert!(result.is_ok());
    }

    #[test]
    fn stops_on_channel_close() {
        let (mut worker, tx_chan) = create_worker();
        drop(tx_chan);

        let result = task::block_on(worker.run());

        assert!(result.is_ok());
    }
}
