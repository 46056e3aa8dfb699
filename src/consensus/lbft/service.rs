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

use super::{
    engine::LbftCore,
    options::LbftOptions,
    worker::{LbftRequestSender, LbftWorker, Request},
};
use crate::{
    base::{schema::Transaction, Context},
    channel::{bounded_channel, confirmed_channel, Receiver},
    consensus::{BatchOutcome, Broadcast, OutputTxs, Stack},
    Error, ErrorKind, Result,
};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

/// Consensus service data.
pub struct LbftService<S: Stack> {
    /// Worker object.
    worker: Option<LbftWorker<S>>,
    /// Threads data.
    handler: Option<JoinHandle<LbftWorker<S>>>,
    /// To send messages to worker.
    tx_chan: LbftRequestSender,
    /// Payloads to broadcast.
    broadcast_rx: Receiver<Broadcast>,
    /// Committed batches in height order.
    committed_rx: Receiver<OutputTxs>,
    quorum: usize,
    /// To check if the worker thread is still alive.
    canary: Arc<()>,
}

fn channel_error<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
    Error::new_ext(ErrorKind::Other, err)
}

impl<S: Stack> LbftService<S> {
    /// Create a new consensus service instance.
    /// Fails when the options cannot be fixed.
    pub fn new(options: LbftOptions, ctx: Context, stack: Arc<S>) -> Result<Self> {
        let options = options.validate()?;
        let quorum = options.q;
        let (broadcast_tx, broadcast_rx) = bounded_channel(options.buffer_size);
        let (committed_tx, committed_rx) = bounded_channel(options.buffer_size);
        let (tx_chan, rx_chan) = confirmed_channel::<Request, BatchOutcome>();

        let core = LbftCore::new(options, ctx, stack, broadcast_tx, committed_tx);

        Ok(LbftService {
            worker: Some(LbftWorker::new(core, rx_chan)),
            handler: None,
            tx_chan,
            broadcast_rx,
            committed_rx,
            quorum,
            canary: Arc::new(()),
        })
    }

    /// Start consensus service.
    pub fn start(&mut self) {
        debug!("Starting consensus service");
        let mut worker = match self.worker.take() {
            Some(worker) => worker,
            None => {
                warn!("service was already running");
                return;
            }
        };

        let mut canary = Arc::clone(&self.canary);
        let handle = thread::spawn(move || {
            let _ = Arc::get_mut(&mut canary);
            worker.run_sync();
            worker
        });
        self.handler = Some(handle);
    }

    /// Stop consensus service.
    pub fn stop(&mut self) {
        debug!("Stopping consensus service");
        match self.handler.take() {
            Some(handle) => {
                if let Err(err) = self.tx_chan.send_sync(Request::Stop) {
                    error!("Error stopping consensus service thread: {:?}", err);
                }
                match handle.join() {
                    Ok(worker) => self.worker = Some(worker),
                    Err(_) => error!("consensus service thread crashed"),
                }
            }
            None => {
                debug!("service was not running");
            }
        };
    }

    /// Check if service is running.
    pub fn is_running(&self) -> bool {
        // Hack to intercept crashed subthreads.
        Arc::strong_count(&self.canary) == 2 && self.worker.is_none()
    }

    /// Hand a payload received from a replica.
    pub fn recv_consensus(&self, payload: Vec<u8>) -> Result<()> {
        self.tx_chan
            .send_sync(Request::Consensus(payload))
            .map(|_| ())
            .map_err(channel_error)
    }

    /// Propose a batch. The receiver gets the batch outcomes.
    pub fn submit(&self, txs: Vec<Transaction>) -> Result<Receiver<BatchOutcome>> {
        self.tx_chan
            .send_sync(Request::Submit(txs))
            .map_err(channel_error)
    }

    /// Payloads to deliver to the replicas.
    pub fn broadcast_channel(&self) -> Receiver<Broadcast> {
        self.broadcast_rx.clone()
    }

    /// Committed transactions, one item per block.
    pub fn committed_txs_channel(&self) -> Receiver<OutputTxs> {
        self.committed_rx.clone()
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }
}
