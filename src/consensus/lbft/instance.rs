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

//! Agreement instance of a single batch.
//!
//! Instances are plain state machines owned by the engine. Whatever they
//! need to tell the engine is queued as an `Action` in the shared state.

use super::{
    gate::SeqGate,
    message::{Commit, Committed, Message, PrePrepare, Prepare, RequestBatch},
    options::LbftOptions,
    timer::Timer,
    vote::{Ballot, VoteTally},
};
use crate::{
    base::{
        schema::{ChainCoordinate, Transaction},
        Context,
    },
    consensus::{BatchOutcome, BatchTicket, Stack},
    validator::check::check_legality,
    Result,
};
use std::{sync::Arc, time::Instant};

bitflags::bitflags! {
    /// Phases passed by an instance.
    pub struct Phase: u8 {
        const PRE_PREPARED = 0b001;
        const PREPARED = 0b010;
        const COMMITTED = 0b100;
    }
}

/// Who is waiting for the fate of a batch.
#[derive(Clone)]
pub enum BatchOwner {
    /// Pulled from the local pool.
    Pool,
    /// Submitted through the service.
    Caller(BatchTicket),
}

impl BatchOwner {
    pub fn settle<S: Stack>(&self, stack: &S, outcome: BatchOutcome, txs: &[Transaction]) {
        match self {
            BatchOwner::Pool => stack.handle_outcome(outcome, txs),
            BatchOwner::Caller(ticket) => {
                if ticket.try_send(outcome).is_err() {
                    debug!("[instance] outcome {:?} dropped", outcome);
                }
            }
        }
    }
}

/// Requests from the instances to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Broadcast(ChainCoordinate, Message),
    Committed(Committed),
    ViewChange(String),
}

/// Engine state visible to the instances.
pub struct Shared<S: Stack> {
    pub options: LbftOptions,
    pub ctx: Context,
    pub stack: Arc<S>,
    /// Highest sequence number verified.
    pub verify_seq_no: u64,
    /// Highest sequence number delivered.
    pub last_exec: u64,
    pub pre_prepare_gate: SeqGate,
    pub commit_gate: SeqGate,
    pub actions: Vec<Action>,
}

impl<S: Stack> Shared<S> {
    pub fn new(options: LbftOptions, ctx: Context, stack: Arc<S>, seq_no: u64) -> Self {
        Shared {
            options,
            ctx,
            stack,
            verify_seq_no: seq_no,
            last_exec: seq_no,
            pre_prepare_gate: SeqGate::new(seq_no),
            commit_gate: SeqGate::new(seq_no),
            actions: vec![],
        }
    }

    fn local(&self) -> &ChainCoordinate {
        &self.options.chain
    }

    fn id(&self) -> &str {
        &self.options.id
    }
}

pub struct Instance {
    name: String,
    seq_no: u64,
    digest: String,
    /// Source and destination chains, known once the batch is.
    chains: Option<(ChainCoordinate, ChainCoordinate)>,
    batch: Option<RequestBatch>,
    primary_id: String,
    phase: Phase,
    prepares: VoteTally<Prepare>,
    commits: VoteTally<Commit>,
    /// Pre-prepare waiting for its turn.
    parked: Option<PrePrepare>,
    /// Commit quorum reached, waiting for its turn.
    commit_ready: bool,
    cleanup: Timer,
    block: Timer,
    owner: Option<BatchOwner>,
    exited: bool,
}

impl Instance {
    pub fn new(name: String, now: Instant, options: &LbftOptions) -> Self {
        let mut cleanup = Timer::default();
        cleanup.start(now, 2 * options.block_timeout);
        let mut block = Timer::default();
        block.start(now, options.block_timeout);
        Instance {
            name,
            seq_no: 0,
            digest: String::new(),
            chains: None,
            batch: None,
            primary_id: String::new(),
            phase: Phase::empty(),
            prepares: VoteTally::default(),
            commits: VoteTally::default(),
            parked: None,
            commit_ready: false,
            cleanup,
            block,
            owner: None,
            exited: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn seq_no(&self) -> u64 {
        self.seq_no
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_exited(&self) -> bool {
        self.exited
    }

    /// Created by early votes, the batch is still unknown.
    pub fn is_idle(&self) -> bool {
        self.batch.is_none() && !self.exited
    }

    /// Waiting on one of the ordering gates.
    pub fn is_parked(&self) -> bool {
        self.parked.is_some() || self.commit_ready
    }

    pub fn deadlines(&self) -> [Option<Instant>; 2] {
        [self.cleanup.deadline(), self.block.deadline()]
    }

    fn txs(&self) -> &[Transaction] {
        self.batch
            .as_ref()
            .map(|batch| batch.requests.as_slice())
            .unwrap_or_default()
    }

    fn settle<S: Stack>(&mut self, shared: &Shared<S>, outcome: BatchOutcome) {
        let owner = match outcome {
            BatchOutcome::Verified => self.owner.clone(),
            _ => self.owner.take(),
        };
        if let Some(owner) = owner {
            owner.settle(shared.stack.as_ref(), outcome, self.txs());
        }
    }

    /// Send a phase vote to the local chain and to the other side of a
    /// cross chain batch.
    fn broadcast_vote<S: Stack>(&self, shared: &mut Shared<S>, msg: Message) {
        let local = shared.local().clone();
        if let Some((from, to)) = &self.chains {
            let remote = if from == &local { to } else { from };
            if remote != &local {
                shared.actions.push(Action::Broadcast(remote.clone(), msg.clone()));
            }
        }
        shared.actions.push(Action::Broadcast(local, msg));
    }

    /// Both sides reached their quorum. The local side must also agree on
    /// the sequence number.
    fn sides_passed<B: Ballot, S: Stack>(&self, tally: &VoteTally<B>, shared: &Shared<S>) -> bool {
        let (from, to) = match &self.chains {
            Some(chains) => chains,
            None => return false,
        };
        let local = shared.local();
        let side_passed = |chain: &ChainCoordinate| {
            let seq_no = if chain == local { Some(self.seq_no) } else { None };
            tally.passed(chain, &self.digest, seq_no)
        };
        side_passed(from) && (from == to || side_passed(to))
    }

    fn on_side(&self, chain: &ChainCoordinate) -> bool {
        match &self.chains {
            Some((from, to)) => chain == from || chain == to,
            None => true,
        }
    }

    /// Vote for this batch. Local votes must also carry its sequence number.
    fn admits<B: Ballot, S: Stack>(&self, vote: &B, shared: &Shared<S>) -> bool {
        if !self.on_side(vote.chain()) {
            return false;
        }
        if self.batch.is_none() {
            return true;
        }
        vote.digest() == self.digest && (vote.chain() != shared.local() || vote.seq_no() == self.seq_no)
    }

    /// Batch proposed by this replica as primary.
    pub fn on_request<S: Stack>(
        &mut self,
        batch: RequestBatch,
        seq_no: u64,
        owner: Option<BatchOwner>,
        shared: &mut Shared<S>,
    ) -> Result<()> {
        let local = shared.local().clone();
        let (from, to) = batch.chains_or(&local)?;
        self.seq_no = seq_no;
        self.digest = batch.digest();
        self.primary_id = shared.id().to_string();
        self.chains = Some((from.clone(), to.clone()));
        self.batch = Some(batch.clone());
        self.owner = owner;

        if !batch.is_empty() && batch.index == 0 && from == local {
            if !shared.stack.verify_batch(&batch.requests, true) {
                self.abort(shared, "primary verification failed");
                return Ok(());
            }
            shared.verify_seq_no = shared.verify_seq_no.max(seq_no);
        }
        if from != to && from == local {
            debug!("[instance] {} relayed to {}", self.name, to);
            shared
                .actions
                .push(Action::Broadcast(to, Message::RequestBatch(batch.clone())));
        }

        let pre_prepare = PrePrepare {
            name: self.name.clone(),
            primary_id: self.primary_id.clone(),
            chain: local.clone(),
            replica_id: self.primary_id.clone(),
            seq_no,
            digest: self.digest.clone(),
            quorum: shared.options.q as u64,
            requests: batch,
        };
        shared.actions.push(Action::Broadcast(
            local,
            Message::PrePrepare(pre_prepare.clone()),
        ));
        self.on_pre_prepare(pre_prepare, shared)
    }

    pub fn on_pre_prepare<S: Stack>(&mut self, msg: PrePrepare, shared: &mut Shared<S>) -> Result<()> {
        if self.exited || self.phase.contains(Phase::PRE_PREPARED) || self.parked.is_some() {
            return Ok(());
        }
        let local = shared.local().clone();
        let chains = msg.requests.chains_or(&local)?;
        if msg.requests.digest() != msg.digest || msg.requests.name(&local, msg.seq_no)? != msg.name {
            self.abort(shared, "digest mismatch");
            return Ok(());
        }
        for tx in msg.requests.requests.iter() {
            if let Err(err) = check_legality(tx, &shared.ctx) {
                warn!("[instance] {} illegal request: {}", self.name, err);
                self.abort(shared, "illegal batch");
                return Ok(());
            }
        }
        if self.batch.is_none() {
            self.seq_no = msg.seq_no;
            self.digest = msg.digest.clone();
            self.primary_id = msg.primary_id.clone();
            self.chains = Some(chains);
            self.batch = Some(msg.requests.clone());
        }
        self.parked = Some(msg);
        self.resume_pre_prepare(shared);
        Ok(())
    }

    /// Complete a parked pre-prepare when its turn came.
    /// Returns true when the instance made progress.
    pub fn resume_pre_prepare<S: Stack>(&mut self, shared: &mut Shared<S>) -> bool {
        if self.exited || self.parked.is_none() || !shared.pre_prepare_gate.can_pass(self.seq_no) {
            return false;
        }
        let local = shared.local().clone();
        let from_local = matches!(&self.chains, Some((from, _)) if from == &local);
        let first_slice = self
            .batch
            .as_ref()
            .map(|batch| !batch.is_empty() && batch.index == 0)
            .unwrap_or(false);
        let needs_verify = first_slice
            && from_local
            && self.primary_id != shared.id()
            && self.seq_no > shared.stack.blockchain_info().seq_no;
        if needs_verify && self.seq_no > shared.verify_seq_no + 1 {
            trace!("[instance] {} waiting for verification", self.name);
            return false;
        }
        self.parked = None;
        if needs_verify && !shared.stack.verify_batch(self.txs(), false) {
            self.abort(shared, "verification failed");
            return true;
        }

        self.phase.insert(Phase::PRE_PREPARED);
        self.cleanup.stop();
        shared.verify_seq_no = shared.verify_seq_no.max(self.seq_no);
        shared.pre_prepare_gate.notify(self.seq_no);
        self.settle(shared, BatchOutcome::Verified);
        debug!("[instance] {} pre-prepared as {}", self.name, self.seq_no);

        let prepare = Prepare {
            name: self.name.clone(),
            primary_id: self.primary_id.clone(),
            chain: local,
            replica_id: shared.id().to_string(),
            seq_no: self.seq_no,
            digest: self.digest.clone(),
            quorum: shared.options.q as u64,
        };
        self.broadcast_vote(shared, Message::Prepare(prepare.clone()));
        self.prepares.add(prepare);
        self.check_prepared(shared);
        true
    }

    pub fn on_prepare<S: Stack>(&mut self, msg: Prepare, shared: &mut Shared<S>) {
        if self.exited || !self.admits(&msg, shared) || !self.prepares.add(msg) {
            return;
        }
        self.check_prepared(shared);
    }

    fn check_prepared<S: Stack>(&mut self, shared: &mut Shared<S>) {
        if !self.phase.contains(Phase::PRE_PREPARED)
            || self.phase.contains(Phase::PREPARED)
            || !self.sides_passed(&self.prepares, shared)
        {
            return;
        }
        self.phase.insert(Phase::PREPARED);
        debug!("[instance] {} prepared", self.name);
        let commit = Commit {
            name: self.name.clone(),
            primary_id: self.primary_id.clone(),
            chain: shared.local().clone(),
            replica_id: shared.id().to_string(),
            seq_no: self.seq_no,
            digest: self.digest.clone(),
            quorum: shared.options.q as u64,
        };
        self.broadcast_vote(shared, Message::Commit(commit.clone()));
        self.commits.add(commit);
        self.check_committed(shared);
    }

    pub fn on_commit<S: Stack>(&mut self, msg: Commit, shared: &mut Shared<S>) {
        if self.exited || !self.admits(&msg, shared) || !self.commits.add(msg) {
            return;
        }
        self.check_committed(shared);
    }

    fn check_committed<S: Stack>(&mut self, shared: &mut Shared<S>) {
        if !self.phase.contains(Phase::PREPARED)
            || self.phase.contains(Phase::COMMITTED)
            || self.commit_ready
            || !self.sides_passed(&self.commits, shared)
        {
            return;
        }
        self.commit_ready = true;
        self.resume_commit(shared);
    }

    /// Complete a commit waiting for its turn.
    /// Returns true when the instance made progress.
    pub fn resume_commit<S: Stack>(&mut self, shared: &mut Shared<S>) -> bool {
        if self.exited || !self.commit_ready || !shared.commit_gate.can_pass(self.seq_no) {
            return false;
        }
        self.commit_ready = false;
        self.phase.insert(Phase::COMMITTED);
        self.block.stop();
        shared.commit_gate.notify(self.seq_no);

        let committed = Committed {
            name: self.name.clone(),
            primary_id: self.primary_id.clone(),
            chain: shared.local().clone(),
            replica_id: shared.id().to_string(),
            seq_no: self.seq_no,
            requests: self.batch.clone().unwrap_or_else(|| RequestBatch::empty_block(0)),
        };
        info!("[instance] {} committed as {}", self.name, self.seq_no);
        shared.actions.push(Action::Broadcast(
            shared.local().clone(),
            Message::Committed(committed.clone()),
        ));
        shared.actions.push(Action::Committed(committed));
        self.settle(shared, BatchOutcome::Succeeded);
        true
    }

    /// Handle the expired timers. Returns true when the instance is done.
    pub fn on_tick<S: Stack>(&mut self, now: Instant, shared: &mut Shared<S>) -> bool {
        if self.cleanup.fired(now) && !self.phase.contains(Phase::PRE_PREPARED) {
            debug!("[instance] {} never started, removed", self.name);
            self.settle(shared, BatchOutcome::Rewind);
            self.exit(shared, true);
            return true;
        }
        if self.block.fired(now)
            && !self.phase.contains(Phase::COMMITTED)
            && self.seq_no > shared.last_exec
        {
            shared
                .actions
                .push(Action::ViewChange(format!("{} block timeout", self.name)));
        }
        self.exited
    }

    fn abort<S: Stack>(&mut self, shared: &mut Shared<S>, reason: &str) {
        warn!("[instance] {} aborted: {}", self.name, reason);
        self.settle(shared, BatchOutcome::Failed);
        self.exit(shared, true);
    }

    /// Terminated by the engine.
    pub fn kill<S: Stack>(&mut self, shared: &mut Shared<S>) {
        if !self.phase.contains(Phase::COMMITTED) {
            self.settle(shared, BatchOutcome::Rewind);
        }
        self.exit(shared, false);
    }

    /// The batch was committed through the peers' `Committed` quorum.
    pub fn committed_by_peers<S: Stack>(&mut self, shared: &mut Shared<S>) {
        if !self.phase.contains(Phase::COMMITTED) {
            self.phase.insert(Phase::COMMITTED);
            self.settle(shared, BatchOutcome::Succeeded);
        }
        self.exit(shared, false);
    }

    /// Release the ordering gates for the successors.
    fn exit<S: Stack>(&mut self, shared: &mut Shared<S>, request_view_change: bool) {
        if self.exited {
            return;
        }
        self.exited = true;
        self.parked = None;
        self.commit_ready = false;
        self.cleanup.stop();
        self.block.stop();
        if self.seq_no > 0 {
            shared.pre_prepare_gate.notify(self.seq_no);
            shared.commit_gate.notify(self.seq_no);
        }
        if request_view_change && self.seq_no > shared.last_exec {
            shared
                .actions
                .push(Action::ViewChange(format!("{} exited", self.name)));
        }
    }
}
