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

//! Replica core: sequencing, primary election and in-order delivery.
//!
//! The core is a single threaded state machine. Every input (network
//! payload, submitted batch, clock tick) is handled to completion before
//! the next one, so no locking is needed among the instances.

use super::{
    instance::{Action, BatchOwner, Instance, Phase, Shared},
    message::{Committed, FetchCommitted, Message, NullRequest, RequestBatch, ViewChange},
    options::LbftOptions,
    timer::{earliest, Timer},
    vote::Campaign,
    CAMPAIGN_LBFT, CAMPAIGN_PERIOD,
};
use crate::{
    base::{
        now_nanos, now_secs,
        schema::{ChainCoordinate, Transaction},
        Context,
    },
    channel::Sender,
    consensus::{BatchOutcome, Broadcast, CommittedTxs, OutputTxs, Stack},
    Error, ErrorKind, Result,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

pub struct LbftCore<S: Stack> {
    shared: Shared<S>,
    /// Hash of the local options, votes carrying a different one are
    /// ignored by the elections.
    opt_hash: String,
    height: u64,
    /// Last sequence number assigned or seen.
    seq_no: u64,
    /// Bid used when voting for itself. Lower wins.
    priority: i64,
    /// Highest priority seen for each past primary.
    primary_history: HashMap<String, i64>,
    primary_id: String,
    last_primary_id: String,
    campaigns: HashMap<String, Campaign>,
    instances: HashMap<String, Instance>,
    /// Committed batches by sequence number, waiting for delivery or kept
    /// for the laggards.
    committed: BTreeMap<u64, Committed>,
    /// Replicas that announced a committed batch, by sequence number and
    /// content digest.
    committed_votes: BTreeMap<u64, HashMap<String, HashSet<String>>>,
    block_timer: Timer,
    batch_timer: Timer,
    new_view_timer: Timer,
    period_timer: Timer,
    null_timer: Timer,
    broadcast_chan: Sender<Broadcast>,
    output_chan: Sender<OutputTxs>,
}

fn instance_entry<'a>(
    instances: &'a mut HashMap<String, Instance>,
    name: &str,
    now: Instant,
    options: &LbftOptions,
) -> &'a mut Instance {
    instances
        .entry(name.to_string())
        .or_insert_with(|| Instance::new(name.to_string(), now, options))
}

impl<S: Stack> LbftCore<S> {
    pub fn new(
        options: LbftOptions,
        ctx: Context,
        stack: Arc<S>,
        broadcast_chan: Sender<Broadcast>,
        output_chan: Sender<OutputTxs>,
    ) -> Self {
        let info = stack.blockchain_info();
        let ctx = Context {
            chain: options.chain.clone(),
            ..ctx
        };
        let opt_hash = options.hash();
        LbftCore {
            shared: Shared::new(options, ctx, stack, info.seq_no),
            opt_hash,
            height: info.height,
            seq_no: info.seq_no,
            priority: now_nanos(),
            primary_history: HashMap::new(),
            primary_id: String::new(),
            last_primary_id: String::new(),
            campaigns: HashMap::new(),
            instances: HashMap::new(),
            committed: BTreeMap::new(),
            committed_votes: BTreeMap::new(),
            block_timer: Timer::default(),
            batch_timer: Timer::default(),
            new_view_timer: Timer::default(),
            period_timer: Timer::default(),
            null_timer: Timer::default(),
            broadcast_chan,
            output_chan,
        }
    }

    /// Arm the clocks. Until then the core only reacts to messages.
    pub fn start(&mut self, now: Instant) {
        self.block_timer.start(now, self.shared.options.block_timeout);
        self.batch_timer.start(now, self.shared.options.batch_timeout);
    }

    pub fn options(&self) -> &LbftOptions {
        &self.shared.options
    }

    pub fn primary_id(&self) -> &str {
        &self.primary_id
    }

    pub fn is_primary(&self) -> bool {
        !self.primary_id.is_empty() && self.primary_id == self.shared.options.id
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn seq_no(&self) -> u64 {
        self.seq_no
    }

    pub fn last_exec(&self) -> u64 {
        self.shared.last_exec
    }

    pub fn instances_len(&self) -> usize {
        self.instances.len()
    }

    fn local(&self) -> &ChainCoordinate {
        &self.shared.options.chain
    }

    fn id(&self) -> &str {
        &self.shared.options.id
    }

    /// When the next timer expires.
    pub fn next_deadline(&self) -> Option<Instant> {
        let timers = [
            self.block_timer,
            self.batch_timer,
            self.new_view_timer,
            self.period_timer,
            self.null_timer,
        ]
        .map(|timer| timer.deadline());
        let campaigns = self
            .campaigns
            .values()
            .flat_map(|campaign| [campaign.timeout.deadline(), campaign.resend.deadline()]);
        let instances = self.instances.values().flat_map(Instance::deadlines);
        earliest(timers.into_iter().chain(campaigns).chain(instances))
    }

    fn send(&self, to: ChainCoordinate, msg: Message) {
        let payload = match msg.encode() {
            Ok(payload) => payload,
            Err(err) => {
                error!("[lbft] encoding {}: {}", msg.tag(), err);
                return;
            }
        };
        if let Err(err) = self.broadcast_chan.try_send(Broadcast { to, payload }) {
            warn!("[lbft] broadcast dropped: {}", err);
        }
    }

    /// Batch handed by the node.
    pub fn submit(&mut self, txs: Vec<Transaction>, owner: Option<BatchOwner>, now: Instant) -> Result<()> {
        let batch = RequestBatch::new(txs, now_secs(), now_nanos());
        let (from, _) = batch.chains_or(self.local())?;
        self.new_view_timer
            .start_once(now, self.shared.options.request);
        if !self.is_primary() {
            debug!("[lbft] not primary, batch of {} sent back", batch.requests.len());
            if let Some(owner) = owner {
                owner.settle(self.shared.stack.as_ref(), BatchOutcome::Rewind, &batch.requests);
            }
            return Ok(());
        }
        if &from != self.local() {
            warn!("[lbft] batch from chain {} refused", from);
            if let Some(owner) = owner {
                owner.settle(self.shared.stack.as_ref(), BatchOutcome::Failed, &batch.requests);
            }
            return Ok(());
        }
        self.handle_request(batch, owner, now)
    }

    /// Assign the next sequence number and start the agreement.
    fn handle_request(&mut self, batch: RequestBatch, owner: Option<BatchOwner>, now: Instant) -> Result<()> {
        let seq_no = self.seq_no + 1;
        let name = batch.name(self.local(), seq_no)?;
        if let Some(false) = self.instances.get(&name).map(Instance::is_idle) {
            debug!("[lbft] {} already running", name);
            return Ok(());
        }
        self.seq_no = seq_no;
        self.new_view_timer
            .start_once(now, self.shared.options.request);
        debug!("[lbft] {} assigned to {}", name, seq_no);
        let instance = instance_entry(&mut self.instances, &name, now, &self.shared.options);
        instance.on_request(batch, seq_no, owner, &mut self.shared)?;
        self.flush(now)
    }

    /// Raw payload from the network.
    pub fn recv(&mut self, buf: &[u8], now: Instant) -> Result<()> {
        match Message::decode(buf) {
            Ok(msg) => self.handle_message(msg, now),
            Err(err) => {
                warn!("[lbft] bad message: {}", err);
                Ok(())
            }
        }
    }

    pub fn handle_message(&mut self, msg: Message, now: Instant) -> Result<()> {
        match msg {
            Message::RequestBatch(batch) => {
                let (from, to) = batch.chains_or(self.local())?;
                if !self.is_primary() || &to != self.local() || &from == self.local() || batch.is_empty_block() {
                    trace!("[lbft] relayed batch ignored");
                    return Ok(());
                }
                self.handle_request(batch, None, now)?;
            }
            Message::PrePrepare(msg) => {
                if self.primary_id.is_empty()
                    || &msg.chain != self.local()
                    || msg.replica_id == self.id()
                    || msg.replica_id != msg.primary_id
                    || msg.primary_id != self.primary_id
                    || msg.seq_no <= self.shared.last_exec
                {
                    trace!("[lbft] pre-prepare {} ignored", msg.name);
                    return Ok(());
                }
                self.seq_no = self.seq_no.max(msg.seq_no);
                let instance = instance_entry(&mut self.instances, &msg.name, now, &self.shared.options);
                instance.on_pre_prepare(msg, &mut self.shared)?;
            }
            Message::Prepare(msg) => {
                if msg.replica_id == self.id() || self.stale_vote(&msg.chain, &msg.primary_id, msg.seq_no) {
                    return Ok(());
                }
                let instance = instance_entry(&mut self.instances, &msg.name, now, &self.shared.options);
                instance.on_prepare(msg, &mut self.shared);
            }
            Message::Commit(msg) => {
                if msg.replica_id == self.id() || self.stale_vote(&msg.chain, &msg.primary_id, msg.seq_no) {
                    return Ok(());
                }
                let instance = instance_entry(&mut self.instances, &msg.name, now, &self.shared.options);
                instance.on_commit(msg, &mut self.shared);
            }
            Message::Committed(msg) => {
                if &msg.chain != self.local()
                    || msg.replica_id == self.id()
                    || msg.seq_no <= self.shared.last_exec
                {
                    return Ok(());
                }
                if msg.seq_no > self.shared.last_exec + 2 * self.shared.options.k {
                    trace!("[lbft] committed {} out of window", msg.seq_no);
                    return Ok(());
                }
                let votes = self
                    .committed_votes
                    .entry(msg.seq_no)
                    .or_default()
                    .entry(msg.content_digest())
                    .or_default();
                votes.insert(msg.replica_id.clone());
                if votes.len() >= self.shared.options.q {
                    self.accept_committed(msg, now)?;
                }
            }
            Message::FetchCommitted(msg) => self.recv_fetch_committed(msg),
            Message::ViewChange(msg) => self.recv_view_change(msg, now)?,
            Message::NullRequest(msg) => self.recv_null_request(msg, now)?,
        }
        self.flush(now)
    }

    /// Local votes must agree on the primary and be still pending.
    fn stale_vote(&self, chain: &ChainCoordinate, primary_id: &str, seq_no: u64) -> bool {
        chain == self.local() && (primary_id != self.primary_id || seq_no <= self.shared.last_exec)
    }

    /// Run the actions queued by the instances and the instances unblocked
    /// by them, until nothing moves.
    fn flush(&mut self, now: Instant) -> Result<()> {
        loop {
            let actions = std::mem::take(&mut self.shared.actions);
            let resumed = self.resume_parked();
            if actions.is_empty() && !resumed {
                break;
            }
            for action in actions {
                match action {
                    Action::Broadcast(to, msg) => self.send(to, msg),
                    Action::Committed(committed) => self.accept_committed(committed, now)?,
                    Action::ViewChange(reason) => {
                        warn!("[lbft] {}", reason);
                        self.send_view_change(CAMPAIGN_LBFT, now)?;
                    }
                }
            }
        }
        self.instances.retain(|_, instance| !instance.is_exited());
        Ok(())
    }

    /// Give the parked instances a chance, lowest sequence number first.
    fn resume_parked(&mut self) -> bool {
        let mut parked: Vec<(u64, String)> = self
            .instances
            .values()
            .filter(|instance| instance.is_parked())
            .map(|instance| (instance.seq_no(), instance.name().to_string()))
            .collect();
        parked.sort();
        let mut resumed = false;
        for (_, name) in parked {
            if let Some(instance) = self.instances.get_mut(&name) {
                resumed |= instance.resume_pre_prepare(&mut self.shared);
                resumed |= instance.resume_commit(&mut self.shared);
            }
        }
        resumed
    }

    fn accept_committed(&mut self, committed: Committed, now: Instant) -> Result<()> {
        if committed.seq_no <= self.shared.last_exec {
            return Ok(());
        }
        if let Some(known) = self.committed.get(&committed.seq_no) {
            if known.name != committed.name {
                return Err(Error::new_ext(
                    ErrorKind::Fatal,
                    format!(
                        "{} and {} both committed as {}",
                        known.name, committed.name, committed.seq_no
                    ),
                ));
            }
            return Ok(());
        }
        self.committed_votes.remove(&committed.seq_no);
        if let Some(mut instance) = self.instances.remove(&committed.name) {
            instance.committed_by_peers(&mut self.shared);
        }
        self.committed.insert(committed.seq_no, committed);
        self.checkpoint(now)
    }

    /// Deliver the committed batches in sequence order.
    fn checkpoint(&mut self, now: Instant) -> Result<()> {
        let mut delivered = false;
        while let Some(committed) = self.committed.get(&(self.shared.last_exec + 1)).cloned() {
            self.shared.last_exec = committed.seq_no;
            self.deliver(committed)?;
            delivered = true;
        }
        let last_exec = self.shared.last_exec;
        let k = self.shared.options.k;

        if let Some(highest) = self.committed.keys().next_back().copied() {
            if highest > last_exec + k {
                return Err(Error::new_ext(
                    ErrorKind::Fatal,
                    format!("committed {} while executed {}", highest, last_exec),
                ));
            }
            if highest > last_exec {
                debug!("[lbft] missing {}, fetching", last_exec + 1);
                let fetch = FetchCommitted {
                    chain: self.local().clone(),
                    replica_id: self.id().to_string(),
                    seq_no: last_exec + 1,
                };
                self.send(self.local().clone(), Message::FetchCommitted(fetch));
            }
        }
        let floor = last_exec.saturating_sub(k);
        self.committed.retain(|seq_no, _| *seq_no > floor);
        self.committed_votes = self.committed_votes.split_off(&(last_exec + 1));

        if delivered {
            self.seq_no = self.seq_no.max(last_exec);
            self.shared.verify_seq_no = self.shared.verify_seq_no.max(last_exec);
            self.shared.pre_prepare_gate.advance(last_exec);
            self.shared.commit_gate.advance(last_exec);
            self.new_view_timer.stop();
            let pending = self
                .instances
                .values()
                .any(|instance| !instance.is_idle() && !instance.phase().contains(Phase::COMMITTED));
            if pending {
                self.new_view_timer
                    .start(now, self.shared.options.request);
            }
        }
        Ok(())
    }

    fn deliver(&mut self, committed: Committed) -> Result<()> {
        let (from, _) = committed.requests.chains_or(self.local())?;
        let is_local_chain = &from == self.local();
        self.height += 1;
        info!(
            "[lbft] delivering {} at height {} ({} txs)",
            committed.seq_no,
            self.height,
            committed.requests.requests.len()
        );
        let output = OutputTxs {
            outputs: vec![CommittedTxs {
                skip: is_local_chain,
                is_local_chain,
                seq_no: committed.seq_no,
                time: committed.requests.time,
                transactions: committed.requests.requests,
            }],
            height: self.height,
        };
        if let Err(err) = self.output_chan.try_send(output) {
            error!("[lbft] output of height {} dropped: {}", self.height, err);
        }
        Ok(())
    }

    fn recv_fetch_committed(&self, msg: FetchCommitted) {
        if &msg.chain != self.local() || msg.replica_id == self.id() || msg.seq_no > self.shared.last_exec {
            return;
        }
        if let Some(committed) = self.committed.get(&msg.seq_no) {
            debug!("[lbft] sending {} to {}", msg.seq_no, msg.replica_id);
            let reply = Committed {
                replica_id: self.id().to_string(),
                ..committed.clone()
            };
            self.send(self.local().clone(), Message::Committed(reply));
        }
    }

    /// Handle the expired timers.
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        if self.block_timer.fired(now) {
            self.block_timer
                .start(now, self.shared.options.block_timeout);
            self.on_block_timeout(now)?;
        }
        if self.batch_timer.fired(now) {
            self.batch_timer
                .start(now, self.shared.options.batch_timeout);
            self.on_batch_timeout(now)?;
        }
        if self.new_view_timer.fired(now) {
            warn!("[lbft] requests not committed in time");
            self.send_view_change(CAMPAIGN_LBFT, now)?;
        }
        if self.period_timer.fired(now) {
            info!("[lbft] periodic view change");
            self.send_view_change(CAMPAIGN_PERIOD, now)?;
        }
        if self.null_timer.fired(now) {
            self.on_null_timeout(now)?;
        }
        self.tick_campaigns(now)?;

        let shared = &mut self.shared;
        let done: Vec<String> = self
            .instances
            .iter_mut()
            .filter_map(|(name, instance)| instance.on_tick(now, shared).then(|| name.clone()))
            .collect();
        for name in done {
            self.instances.remove(&name);
        }
        self.flush(now)
    }

    fn on_block_timeout(&mut self, now: Instant) -> Result<()> {
        if self.primary_id.is_empty() {
            if !self.campaigns.contains_key(CAMPAIGN_LBFT) {
                info!("[lbft] no primary, starting election");
                self.send_view_change(CAMPAIGN_LBFT, now)?;
            }
        } else if self.is_primary() && self.instances.values().all(Instance::is_idle) {
            self.handle_request(RequestBatch::empty_block(now_secs()), None, now)?;
        }
        Ok(())
    }

    fn on_batch_timeout(&mut self, now: Instant) -> Result<()> {
        if !self.is_primary() {
            return Ok(());
        }
        let options = &self.shared.options;
        let txs = self
            .shared
            .stack
            .next_batch(options.batch_size, options.batch_timeout);
        if txs.is_empty() {
            return Ok(());
        }
        self.submit(txs, Some(BatchOwner::Pool), now)
    }

    fn on_null_timeout(&mut self, now: Instant) -> Result<()> {
        if self.is_primary() {
            let msg = NullRequest {
                replica_id: self.id().to_string(),
                chain: self.local().clone(),
                primary_id: self.id().to_string(),
                h: self.height,
            };
            self.send(self.local().clone(), Message::NullRequest(msg));
            self.null_timer
                .start(now, self.shared.options.null_request);
        } else if !self.primary_id.is_empty() {
            warn!("[lbft] primary {} is silent", self.primary_id);
            self.send_view_change(CAMPAIGN_LBFT, now)?;
        }
        Ok(())
    }

    fn reset_null_timer(&mut self, now: Instant) {
        let options = &self.shared.options;
        if self.is_primary() {
            self.null_timer.start(now, options.null_request);
        } else if !self.primary_id.is_empty() {
            self.null_timer
                .start(now, options.block_timeout + options.null_request);
        } else {
            self.null_timer.stop();
        }
    }

    fn recv_null_request(&mut self, msg: NullRequest, now: Instant) -> Result<()> {
        if &msg.chain != self.local() || msg.replica_id == self.id() {
            return Ok(());
        }
        if self.primary_id.is_empty()
            && self.last_primary_id.is_empty()
            && msg.primary_id == msg.replica_id
        {
            info!("[lbft] joining primary {}", msg.primary_id);
            let vote = ViewChange {
                replica_id: msg.replica_id.clone(),
                chain: msg.chain.clone(),
                priority: self
                    .primary_history
                    .get(&msg.primary_id)
                    .copied()
                    .unwrap_or_default(),
                primary_id: msg.primary_id.clone(),
                h: self.height,
                id: CAMPAIGN_LBFT.to_string(),
                seq_no: self.shared.last_exec,
                opt_hash: self.opt_hash.clone(),
            };
            self.new_view(vote, now)?;
        }
        if msg.primary_id == self.primary_id {
            self.reset_null_timer(now);
        }
        Ok(())
    }

    fn tick_campaigns(&mut self, now: Instant) -> Result<()> {
        let q = self.shared.options.q;
        let mut resend = vec![];
        self.campaigns.retain(|id, campaign| {
            if campaign.resend.fired(now) {
                resend.push(id.clone());
            }
            if campaign.timeout.fired(now) && campaign.len() < q {
                debug!("[lbft] campaign {} expired", id);
                return false;
            }
            true
        });
        for id in resend {
            self.resend_view_change(&id, now)?;
        }
        Ok(())
    }

    /// Candidate acceptable for this replica.
    fn is_eligible(&self, vote: &ViewChange) -> bool {
        let fresh = self
            .primary_history
            .get(&vote.primary_id)
            .map(|priority| vote.priority > *priority)
            .unwrap_or(true);
        fresh
            && vote.seq_no == self.shared.last_exec
            && vote.h == self.height
            && vote.opt_hash == self.opt_hash
    }

    fn send_view_change(&mut self, id: &str, now: Instant) -> Result<()> {
        let voted = self
            .campaigns
            .get(id)
            .map(|campaign| campaign.has_voted(self.id()))
            .unwrap_or(false);
        if voted {
            return Ok(());
        }
        let vote = ViewChange {
            replica_id: self.id().to_string(),
            chain: self.local().clone(),
            priority: self.priority,
            primary_id: self.id().to_string(),
            h: self.height,
            id: id.to_string(),
            seq_no: self.shared.last_exec,
            opt_hash: self.opt_hash.clone(),
        };
        info!("[lbft] view change {} at {}", id, vote.seq_no);
        self.send(self.local().clone(), Message::ViewChange(vote.clone()));
        self.recv_view_change(vote, now)
    }

    /// Vote again for the best candidate seen in a stalled campaign.
    fn resend_view_change(&mut self, id: &str, now: Instant) -> Result<()> {
        let candidate = match self.campaigns.get(id) {
            Some(campaign) => campaign.best_candidate(|vote| {
                vote.primary_id != self.last_primary_id && self.is_eligible(vote)
            }),
            None => return Ok(()),
        };
        let vote = match candidate {
            Some(vote) => vote,
            None => {
                debug!("[lbft] campaign {} without candidates", id);
                self.campaigns.remove(id);
                return Ok(());
            }
        };
        if let Some(campaign) = self.campaigns.get_mut(id) {
            campaign.clear();
        }
        let vote = ViewChange {
            replica_id: self.id().to_string(),
            h: self.height,
            ..vote
        };
        info!("[lbft] campaign {} voting for {}", id, vote.primary_id);
        self.send(self.local().clone(), Message::ViewChange(vote.clone()));
        self.recv_view_change(vote, now)
    }

    fn recv_view_change(&mut self, vote: ViewChange, now: Instant) -> Result<()> {
        if &vote.chain != self.local() {
            return Ok(());
        }
        if !self.primary_id.is_empty()
            && vote.replica_id == self.primary_id
            && vote.primary_id == vote.replica_id
            && vote.replica_id != self.id()
        {
            info!("[lbft] primary {} stepped down", self.primary_id);
            self.last_primary_id = std::mem::take(&mut self.primary_id);
            self.send_view_change(&vote.id, now)?;
        }

        let q = self.shared.options.q;
        let campaign = self.campaigns.entry(vote.id.clone()).or_default();
        if !campaign.add(vote.clone()) {
            return Ok(());
        }
        if campaign.len() == 1 {
            campaign
                .timeout
                .start(now, self.shared.options.view_change);
        }
        if campaign.len() >= q && campaign.timeout.is_armed() {
            campaign.timeout.stop();
            campaign
                .resend
                .start(now, self.shared.options.resend_view_change);
            info!("[lbft] campaign {} reached quorum", vote.id);
            if !self.primary_id.is_empty() {
                self.last_primary_id = std::mem::take(&mut self.primary_id);
            }
            self.kill_instances();
        }

        let elected = self
            .campaigns
            .get(&vote.id)
            .and_then(|campaign| campaign.elected(q, |vote| self.is_eligible(vote)));
        match elected {
            Some(winner) => self.new_view(winner, now),
            None => Ok(()),
        }
    }

    fn kill_instances(&mut self) {
        for (_, mut instance) in self.instances.drain() {
            instance.kill(&mut self.shared);
        }
    }

    /// Install the elected primary.
    fn new_view(&mut self, vote: ViewChange, now: Instant) -> Result<()> {
        self.campaigns.clear();
        info!(
            "[lbft] new view: primary {} at {}",
            vote.primary_id, vote.seq_no
        );
        if !self.primary_id.is_empty() && self.primary_id != vote.primary_id {
            self.last_primary_id = std::mem::take(&mut self.primary_id);
        }
        self.primary_id = vote.primary_id.clone();
        self.primary_history
            .insert(vote.primary_id.clone(), vote.priority);
        if self.is_primary() {
            self.priority = now_nanos();
        }
        self.height = vote.h;
        self.seq_no = vote.seq_no;
        self.shared.verify_seq_no = vote.seq_no;
        self.kill_instances();
        self.shared.pre_prepare_gate.reset(vote.seq_no);
        self.shared.commit_gate.reset(vote.seq_no);
        self.committed.retain(|seq_no, _| *seq_no <= vote.seq_no);
        self.committed_votes.clear();

        let options = &self.shared.options;
        self.new_view_timer.stop();
        if options.view_change_period > options.block_timeout {
            self.period_timer.start(now, options.view_change_period);
        }
        self.reset_null_timer(now);
        if self.is_primary() {
            self.block_timer
                .start(now, self.shared.options.block_timeout);
            self.handle_request(RequestBatch::empty_block(now_secs()), None, now)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::schema::{
            tests::{chain, create_test_tx, create_test_tx_ext},
            TxType,
        },
        channel::{bounded_channel, Receiver},
        consensus::{
            lbft::message::{Commit, PrePrepare, Prepare},
            MockStack,
        },
        crypto::ed25519::tests::ed25519_test_keypair,
        ledger::BlockchainInfo,
    };
    use std::time::Duration;

    const ME: &str = "00:a";

    struct Harness {
        core: LbftCore<MockStack>,
        network: Receiver<Broadcast>,
        output: Receiver<OutputTxs>,
        now: Instant,
    }

    fn create_stack() -> MockStack {
        let mut stack = MockStack::new();
        stack.expect_verify_batch().returning(|_, _| true);
        stack
            .expect_blockchain_info()
            .returning(BlockchainInfo::default);
        stack.expect_next_batch().returning(|_, _| vec![]);
        stack.expect_handle_outcome().returning(|_, _| ());
        stack
    }

    fn create_options() -> LbftOptions {
        LbftOptions {
            id: ME.to_string(),
            chain: chain("00"),
            block_timeout: Duration::from_millis(100),
            batch_timeout: Duration::from_millis(50),
            request: Duration::from_millis(600),
            view_change: Duration::from_millis(100),
            resend_view_change: Duration::from_millis(50),
            null_request: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn create_harness() -> Harness {
        let (broadcast_tx, network) = bounded_channel(1000);
        let (output_tx, output) = bounded_channel(1000);
        let mut core = LbftCore::new(
            create_options(),
            Context::new(chain("00"), vec![]),
            Arc::new(create_stack()),
            broadcast_tx,
            output_tx,
        );
        let now = Instant::now();
        core.start(now);
        Harness {
            core,
            network,
            output,
            now,
        }
    }

    impl Harness {
        fn sent(&self) -> Vec<(ChainCoordinate, Message)> {
            let mut sent = vec![];
            while let Ok(broadcast) = self.network.try_recv() {
                sent.push((broadcast.to, Message::decode(&broadcast.payload).unwrap()));
            }
            sent
        }

        fn vote_for(&self, replica: &str, primary: &str, priority: i64) -> ViewChange {
            ViewChange {
                replica_id: replica.to_string(),
                chain: chain("00"),
                priority,
                primary_id: primary.to_string(),
                h: self.core.height(),
                id: CAMPAIGN_LBFT.to_string(),
                seq_no: self.core.last_exec(),
                opt_hash: self.core.opt_hash.clone(),
            }
        }

        fn install_primary(&mut self, primary: &str) {
            let vote = self.vote_for(primary, primary, 1);
            self.core.new_view(vote, self.now).unwrap();
        }

        fn at(&self, millis: u64) -> Instant {
            self.now + Duration::from_millis(millis)
        }
    }

    fn committed_from(replica: &str, seq_no: u64, nonce: u32) -> Committed {
        let batch = RequestBatch::new(vec![create_test_tx(nonce, 1)], 1_600_000_000, nonce as i64);
        Committed {
            name: batch.key(&chain("00")).unwrap(),
            primary_id: "00:p".to_string(),
            chain: chain("00"),
            replica_id: replica.to_string(),
            seq_no,
            requests: batch,
        }
    }

    fn pre_prepare_of(sent: &[(ChainCoordinate, Message)]) -> PrePrepare {
        sent.iter()
            .find_map(|(_, msg)| match msg {
                Message::PrePrepare(msg) => Some(msg.clone()),
                _ => None,
            })
            .unwrap()
    }

    fn prepare_from(pre_prepare: &PrePrepare, replica: &str) -> Prepare {
        Prepare {
            name: pre_prepare.name.clone(),
            primary_id: pre_prepare.primary_id.clone(),
            chain: chain("00"),
            replica_id: replica.to_string(),
            seq_no: pre_prepare.seq_no,
            digest: pre_prepare.digest.clone(),
            quorum: 3,
        }
    }

    #[test]
    fn primary_delivers_empty_block() {
        let mut harness = create_harness();
        harness.install_primary(ME);
        let pre_prepare = pre_prepare_of(&harness.sent());
        assert_eq!(pre_prepare.seq_no, 1);
        assert!(pre_prepare.requests.is_empty_block());

        for replica in ["00:b", "00:c"] {
            let msg = Message::Prepare(prepare_from(&pre_prepare, replica));
            harness.core.handle_message(msg, harness.now).unwrap();
        }
        for replica in ["00:b", "00:c"] {
            let msg = Message::Commit(Commit::from(prepare_from(&pre_prepare, replica)));
            harness.core.handle_message(msg, harness.now).unwrap();
        }

        let output = harness.output.try_recv().unwrap();
        assert_eq!(output.height, 1);
        assert!(output.is_empty());
        assert!(output.outputs[0].skip);
        assert_eq!(harness.core.last_exec(), 1);
        assert_eq!(harness.core.instances_len(), 0);
    }

    #[test]
    fn cross_chain_batch_relayed() {
        let mut harness = create_harness();
        harness.install_primary(ME);
        harness.sent();
        let tx = create_test_tx_ext(&ed25519_test_keypair(), TxType::AcrossChain, "00", "01", 1, 1);

        harness.core.submit(vec![tx], None, harness.now).unwrap();

        let sent = harness.sent();
        assert!(sent
            .iter()
            .any(|(to, msg)| to == &chain("01") && matches!(msg, Message::RequestBatch(_))));
        assert!(sent
            .iter()
            .any(|(to, msg)| to == &chain("00") && matches!(msg, Message::PrePrepare(_))));
    }

    #[test]
    fn relayed_batch_proposed_by_destination() {
        let mut harness = create_harness();
        harness.install_primary(ME);
        harness.sent();
        let tx = create_test_tx_ext(&ed25519_test_keypair(), TxType::AcrossChain, "01", "00", 1, 1);
        let batch = RequestBatch::new(vec![tx], 1_600_000_000, 9);

        harness
            .core
            .handle_message(Message::RequestBatch(batch), harness.now)
            .unwrap();

        let sent = harness.sent();
        assert!(!sent
            .iter()
            .any(|(_, msg)| matches!(msg, Message::RequestBatch(_))));
        assert_eq!(pre_prepare_of(&sent).seq_no, 2);
    }

    #[test]
    fn backup_sends_batch_back() {
        let mut harness = create_harness();
        harness.install_primary("00:p");
        let (ticket, outcome) = bounded_channel(1);

        harness
            .core
            .submit(vec![create_test_tx(1, 1)], Some(BatchOwner::Caller(ticket)), harness.now)
            .unwrap();

        assert_eq!(outcome.try_recv().unwrap(), BatchOutcome::Rewind);
    }

    #[test]
    fn mixed_batch_is_fatal() {
        let mut harness = create_harness();
        harness.install_primary(ME);
        let txs = vec![
            create_test_tx(1, 1),
            create_test_tx_ext(&ed25519_test_keypair(), TxType::AcrossChain, "01", "00", 2, 1),
        ];

        let err = harness.core.submit(txs, None, harness.now).unwrap_err();

        assert_eq!(err.kind, ErrorKind::Fatal);
    }

    #[test]
    fn request_timeout_elects_new_primary() {
        let mut harness = create_harness();
        harness.install_primary("00:p");
        let batch = RequestBatch::new(vec![create_test_tx(1, 1)], 1_600_000_000, 1);
        let pre_prepare = PrePrepare {
            name: batch.key(&chain("00")).unwrap(),
            primary_id: "00:p".to_string(),
            chain: chain("00"),
            replica_id: "00:p".to_string(),
            seq_no: 1,
            digest: batch.digest(),
            quorum: 3,
            requests: batch,
        };
        harness
            .core
            .handle_message(Message::PrePrepare(pre_prepare), harness.now)
            .unwrap();
        harness.core.submit(vec![create_test_tx(2, 1)], None, harness.now).unwrap();
        assert_eq!(harness.core.instances_len(), 1);
        harness.sent();

        harness.core.tick(harness.at(600)).unwrap();

        let own_vote = harness.sent().into_iter().find_map(|(_, msg)| match msg {
            Message::ViewChange(vote) => Some(vote),
            _ => None,
        });
        assert_eq!(own_vote.unwrap().primary_id, ME);

        for replica in ["00:b", "00:c"] {
            let vote = harness.vote_for(replica, "00:b", 5);
            harness
                .core
                .handle_message(Message::ViewChange(vote), harness.at(610))
                .unwrap();
        }
        assert_eq!(harness.core.primary_id(), "");
        assert_eq!(harness.core.instances_len(), 0);

        let vote = harness.vote_for("00:d", "00:b", 5);
        harness
            .core
            .handle_message(Message::ViewChange(vote), harness.at(620))
            .unwrap();

        assert_eq!(harness.core.primary_id(), "00:b");
        assert_eq!(harness.core.seq_no(), 0);
    }

    #[test]
    fn initial_election_converges_on_lowest_bid() {
        let mut harness = create_harness();

        harness.core.tick(harness.at(100)).unwrap();
        for (replica, priority) in [("00:b", 10), ("00:c", 20)] {
            let vote = harness.vote_for(replica, replica, priority);
            harness
                .core
                .handle_message(Message::ViewChange(vote), harness.at(110))
                .unwrap();
        }
        assert_eq!(harness.core.primary_id(), "");
        harness.sent();

        harness.core.tick(harness.at(160)).unwrap();
        let resent = harness.sent().into_iter().find_map(|(_, msg)| match msg {
            Message::ViewChange(vote) => Some(vote),
            _ => None,
        });
        let resent = resent.unwrap();
        assert_eq!(resent.replica_id, ME);
        assert_eq!(resent.primary_id, "00:b");

        for replica in ["00:b", "00:c"] {
            let vote = harness.vote_for(replica, "00:b", 10);
            harness
                .core
                .handle_message(Message::ViewChange(vote), harness.at(170))
                .unwrap();
        }

        assert_eq!(harness.core.primary_id(), "00:b");
    }

    #[test]
    fn null_request_adopted_by_fresh_replica() {
        let mut harness = create_harness();
        let msg = NullRequest {
            replica_id: "00:p".to_string(),
            chain: chain("00"),
            primary_id: "00:p".to_string(),
            h: 0,
        };

        harness
            .core
            .handle_message(Message::NullRequest(msg), harness.now)
            .unwrap();

        assert_eq!(harness.core.primary_id(), "00:p");
    }

    #[test]
    fn primary_sends_null_requests() {
        let mut harness = create_harness();
        harness.install_primary(ME);
        harness.sent();

        harness.core.tick(harness.at(1000)).unwrap();

        assert!(harness
            .sent()
            .iter()
            .any(|(_, msg)| matches!(msg, Message::NullRequest(nr) if nr.primary_id == ME)));
    }

    #[test]
    fn committed_needs_quorum_of_replicas() {
        let mut harness = create_harness();
        harness.install_primary("00:p");

        for replica in ["00:p", "00:b", "00:b"] {
            let msg = Message::Committed(committed_from(replica, 1, 1));
            harness.core.handle_message(msg, harness.now).unwrap();
        }
        assert!(harness.output.try_recv().is_err());

        let msg = Message::Committed(committed_from("00:c", 1, 1));
        harness.core.handle_message(msg, harness.now).unwrap();

        let output = harness.output.try_recv().unwrap();
        assert_eq!(output.height, 1);
        assert_eq!(output.outputs[0].seq_no, 1);
        assert_eq!(output.len(), 1);
    }

    #[test]
    fn committed_counted_per_sequence_and_content() {
        let mut harness = create_harness();
        harness.install_primary("00:p");

        for replica in ["00:p", "00:b"] {
            let msg = Message::Committed(committed_from(replica, 1, 1));
            harness.core.handle_message(msg, harness.now).unwrap();
        }
        let msg = Message::Committed(committed_from("00:x", 2, 1));
        harness.core.handle_message(msg, harness.now).unwrap();
        assert!(harness.output.try_recv().is_err());

        let msg = Message::Committed(committed_from("00:c", 1, 1));
        harness.core.handle_message(msg, harness.now).unwrap();

        let output = harness.output.try_recv().unwrap();
        assert_eq!((output.height, output.outputs[0].seq_no), (1, 1));
        assert!(harness.output.try_recv().is_err());
        assert_eq!(harness.core.last_exec(), 1);
    }

    #[test]
    fn committed_tallies_bounded() {
        let mut harness = create_harness();
        harness.install_primary("00:p");
        let far = 2 * harness.core.options().k + 1;

        for (seq_no, nonce) in [(1, 9), (2, 9), (far, 5)] {
            let msg = Message::Committed(committed_from("00:x", seq_no, nonce));
            harness.core.handle_message(msg, harness.now).unwrap();
        }
        assert_eq!(harness.core.committed_votes.len(), 2);

        for replica in ["00:p", "00:b", "00:c"] {
            let msg = Message::Committed(committed_from(replica, 1, 1));
            harness.core.handle_message(msg, harness.now).unwrap();
        }

        assert_eq!(harness.core.last_exec(), 1);
        let pending: Vec<u64> = harness.core.committed_votes.keys().copied().collect();
        assert_eq!(pending, vec![2]);
    }

    #[test]
    fn own_batch_committed_by_peers_succeeds() {
        let mut harness = create_harness();
        harness.install_primary(ME);
        harness.sent();
        let (ticket, outcomes) = bounded_channel(4);
        harness
            .core
            .submit(vec![create_test_tx(1, 1)], Some(BatchOwner::Caller(ticket)), harness.now)
            .unwrap();
        let pre_prepare = pre_prepare_of(&harness.sent());
        assert_eq!(pre_prepare.seq_no, 2);

        for replica in ["00:b", "00:c", "00:d"] {
            let committed = Committed {
                name: pre_prepare.name.clone(),
                primary_id: ME.to_string(),
                chain: chain("00"),
                replica_id: replica.to_string(),
                seq_no: 2,
                requests: pre_prepare.requests.clone(),
            };
            harness
                .core
                .handle_message(Message::Committed(committed), harness.now)
                .unwrap();
        }

        assert_eq!(outcomes.try_recv().unwrap(), BatchOutcome::Verified);
        assert_eq!(outcomes.try_recv().unwrap(), BatchOutcome::Succeeded);
        assert!(outcomes.try_recv().is_err());
    }

    #[test]
    fn reelection_applies_view() {
        let mut harness = create_harness();
        harness.install_primary("00:p");
        let batch = RequestBatch::new(vec![create_test_tx(1, 1)], 1_600_000_000, 1);
        let pre_prepare = PrePrepare {
            name: batch.key(&chain("00")).unwrap(),
            primary_id: "00:p".to_string(),
            chain: chain("00"),
            replica_id: "00:p".to_string(),
            seq_no: 1,
            digest: batch.digest(),
            quorum: 3,
            requests: batch,
        };
        harness
            .core
            .handle_message(Message::PrePrepare(pre_prepare), harness.now)
            .unwrap();
        assert_eq!(harness.core.instances_len(), 1);

        let vote = harness.vote_for("00:b", "00:p", 7);
        harness.core.new_view(vote, harness.now).unwrap();

        assert_eq!(harness.core.primary_id(), "00:p");
        assert_eq!(harness.core.primary_history["00:p"], 7);
        assert_eq!(harness.core.last_primary_id, "");
        assert_eq!(harness.core.instances_len(), 0);
    }

    #[test]
    fn empty_blocks_get_distinct_instances() {
        let mut harness = create_harness();
        harness.install_primary(ME);
        let first = pre_prepare_of(&harness.sent());

        harness
            .core
            .handle_request(RequestBatch::empty_block(first.requests.time), None, harness.now)
            .unwrap();

        let second = pre_prepare_of(&harness.sent());
        assert_eq!(second.seq_no, 2);
        assert_ne!(first.name, second.name);
        assert_eq!(harness.core.instances_len(), 2);
    }

    #[test]
    fn gap_fetched_and_delivered_in_order() {
        let mut harness = create_harness();
        harness.install_primary("00:p");
        harness.sent();

        for replica in ["00:p", "00:b", "00:c"] {
            let msg = Message::Committed(committed_from(replica, 2, 2));
            harness.core.handle_message(msg, harness.now).unwrap();
        }
        assert!(harness.output.try_recv().is_err());
        assert!(harness
            .sent()
            .iter()
            .any(|(_, msg)| matches!(msg, Message::FetchCommitted(f) if f.seq_no == 1)));

        for replica in ["00:p", "00:b", "00:c"] {
            let msg = Message::Committed(committed_from(replica, 1, 1));
            harness.core.handle_message(msg, harness.now).unwrap();
        }

        let first = harness.output.try_recv().unwrap();
        let second = harness.output.try_recv().unwrap();
        assert_eq!((first.height, first.outputs[0].seq_no), (1, 1));
        assert_eq!((second.height, second.outputs[0].seq_no), (2, 2));
        assert_eq!(harness.core.last_exec(), 2);
    }

    #[test]
    fn fetch_answered_from_history() {
        let mut harness = create_harness();
        harness.install_primary("00:p");
        for replica in ["00:p", "00:b", "00:c"] {
            let msg = Message::Committed(committed_from(replica, 1, 1));
            harness.core.handle_message(msg, harness.now).unwrap();
        }
        harness.sent();
        let fetch = FetchCommitted {
            chain: chain("00"),
            replica_id: "00:d".to_string(),
            seq_no: 1,
        };

        harness
            .core
            .handle_message(Message::FetchCommitted(fetch), harness.now)
            .unwrap();

        let reply = harness.sent().into_iter().find_map(|(_, msg)| match msg {
            Message::Committed(c) => Some(c),
            _ => None,
        });
        let reply = reply.unwrap();
        assert_eq!(reply.replica_id, ME);
        assert_eq!(reply.seq_no, 1);
    }

    #[test]
    fn falling_behind_is_fatal() {
        let mut harness = create_harness();
        harness.install_primary("00:p");

        let err = harness
            .core
            .accept_committed(committed_from("00:p", 12, 12), harness.now)
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Fatal);
    }

    #[test]
    fn conflicting_commits_are_fatal() {
        let mut harness = create_harness();
        harness.install_primary("00:p");
        harness
            .core
            .accept_committed(committed_from("00:p", 2, 2), harness.now)
            .unwrap();

        let err = harness
            .core
            .accept_committed(committed_from("00:p", 2, 3), harness.now)
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Fatal);
    }

    #[test]
    fn garbage_payload_ignored() {
        let mut harness = create_harness();

        harness.core.recv(&[0xc1, 0x00], harness.now).unwrap();

        assert!(harness.sent().is_empty());
    }
}
