/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The phase handlers: Announce, Commit, Challenge and Respond.
//!
//! Each handler is entered either with a message from the tree (`Some(...)`) or, for leaves and for
//! expired deadlines, with nothing. A handler that is waiting on children returns early and is entered
//! again on the next message or when [expire_phases](Node::expire_phases) finds its deadline passed.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use crate::app::App;
use crate::events::{ChallengeEvent, CommitEvent, Event, RespondEvent, RoundDoneEvent, StartRoundEvent, VerificationFailedEvent};
use crate::failure::Phase;
use crate::messages::{
    AnnouncementMessage, ChallengeMessage, CommitmentMessage, EncodedPoint, EncodedScalar, Payload,
    ResponseMessage,
};
use crate::networking::Network;
use crate::node::Node;
use crate::types::{
    basic::{NodeName, RoundNumber, ViewNumber},
    suite::Suite,
    view::View,
    vote::VoteResponse,
};

use super::merkle::{check_proof, hash_log, CombinedTree, Proof};
use super::round::{ChildCommit, ChildResponse, Round, RoundPhase, RoundType, SigningMode};
use super::signature::{challenge, CollectiveSignature};
use super::SignError;

impl<S: Suite, N: Network, A: App> Node<S, N, A> {
    /// Start a signing round over `message` as the root of the current view.
    pub(crate) fn start_signing_round(&mut self, message: Vec<u8>) -> Result<(), SignError> {
        if self.changing_view() {
            return Err(SignError::ChangingView);
        }
        let view = self.view();
        if !self.is_root(view) {
            return Err(SignError::NotRoot(view));
        }

        let round = self.last_seen_round() + 1;
        let am = AnnouncementMessage {
            log_test: message,
            round,
            vote: None,
        };
        self.announce(view, am)?;
        self.received_heartbeat();
        self.publish(Event::StartRound(StartRoundEvent {
            timestamp: SystemTime::now(),
            view,
            round,
            round_type: RoundType::Signing,
        }));
        Ok(())
    }

    /// Announce phase of a signing round: subject to fault injection, then [announce_round](Self::announce_round).
    pub(crate) fn announce(&mut self, view: ViewNumber, am: AnnouncementMessage) -> Result<(), SignError> {
        log::debug!("{}: announce round {} in view {}", self.name, am.round, view);
        self.try_failure(view, am.round)?;
        self.announce_round(view, am)
    }

    /// Set up the round, pass the announcement on to the children, and commit straight away if this node
    /// is a leaf.
    pub(crate) fn announce_round(&mut self, view: ViewNumber, am: AnnouncementMessage) -> Result<(), SignError> {
        let round = am.round;
        let view_info = self.set_up_round(view, &am)?;
        self.put_down(view, Payload::Announcement(am))?;
        if view_info.is_leaf() {
            self.commit(round, None)?;
        }
        Ok(())
    }

    /// Allocate the state for a new round. Fails with [SignError::PastRound] without touching any state if
    /// the round is not newer than every round seen so far.
    pub(crate) fn set_up_round(&mut self, view: ViewNumber, am: &AnnouncementMessage) -> Result<View, SignError> {
        let view_info = self.view_snapshot(view)?;
        {
            let mut last_seen_round = crate::node::lock(&self.shared.last_seen_round);
            if am.round <= *last_seen_round {
                return Err(SignError::PastRound {
                    round: am.round,
                    last_seen: *last_seen_round,
                });
            }
            *last_seen_round = am.round;
        }

        let seed = [
            self.name.bytes(),
            &view.int().to_le_bytes()[..],
            &am.round.to_le_bytes()[..],
        ]
        .concat();
        let v = self.keypair.derive_scalar(&self.suite, b"round-commitment", &seed);
        let commit_deadline = Instant::now() + self.phase_deadline(&view_info);
        let round = Round::new(
            &self.suite,
            am.round,
            view,
            am.log_test.clone(),
            am.vote.clone(),
            v,
            self.keypair.public(),
            commit_deadline,
        );
        self.rounds.insert(am.round, round);
        self.gc_rounds(am.round);
        Ok(view_info)
    }

    /// How long this node waits for its children in one phase: one phase timeout per level below it, so that
    /// a child that is itself waiting out a deadline can still report in time.
    fn phase_deadline(&self, view_info: &View) -> Duration {
        let height = view_info.subtree_height(&self.name).max(1) as u32;
        self.params.phase_timeout * height
    }

    /// Commit phase. Buffers `commitment` and, once every child has committed, aggregates.
    pub(crate) fn commit(
        &mut self,
        round_no: RoundNumber,
        commitment: Option<(NodeName, CommitmentMessage)>,
    ) -> Result<(), SignError> {
        self.update_last_seen_round(round_no);
        let round_view = match self.rounds.get(&round_no) {
            Some(round) if round.phase == RoundPhase::Announced => round.view,
            _ => return Ok(()),
        };
        let view_info = self.view_snapshot(round_view)?;

        if let Some((from, com)) = commitment {
            let suite = &self.suite;
            let child = ChildCommit {
                v_hat: com.v_hat.decode(suite)?,
                x_hat: com.x_hat.decode(suite)?,
                mt_root: com.mt_root,
            };
            let exceptions = com
                .exception_list
                .iter()
                .map(|key| key.decode(suite))
                .collect::<Result<Vec<_>, _>>()?;

            if let Some(round) = self.rounds.get_mut(&round_no) {
                if round.committed(&from) {
                    return Ok(());
                }
                if let (Some(mine), Some(theirs)) = (round.vote.as_mut(), com.vote.as_ref()) {
                    mine.count.merge(&theirs.count);
                }
                round.commits.insert(from, child);
                round.commit_exceptions.extend(exceptions);
            }
        }

        let committed = self.rounds.get(&round_no).map_or(0, |round| round.commits.len());
        if committed < view_info.children.len() {
            return Ok(());
        }
        self.finish_commits(round_no)
    }

    /// Aggregate whatever commitments have arrived, build the Merkle tree, and move on.
    pub(crate) fn finish_commits(&mut self, round_no: RoundNumber) -> Result<(), SignError> {
        let (round_view, round_type) = match self.rounds.get(&round_no) {
            Some(round) if round.phase == RoundPhase::Announced => (round.view, round.round_type),
            _ => return Ok(()),
        };
        let view_info = self.view_snapshot(round_view)?;

        let missing: Vec<NodeName> = view_info
            .children
            .iter()
            .filter(|child| !self.rounds[&round_no].committed(child))
            .cloned()
            .collect();
        let missing_keys: Vec<S::Point> = missing
            .iter()
            .flat_map(|child| self.subtree_keys(&view_info, child))
            .collect();
        if !missing.is_empty() {
            log::info!("{}: round {} committing without {:?}", self.name, round_no, missing);
        }

        let merkle = round_type == RoundType::Signing && self.params.signing_mode == SigningMode::MerkleTree;
        let local_leaf = if merkle { self.app.commit(round_view) } else { None };

        let suite = &self.suite;
        let Some(round) = self.rounds.get_mut(&round_no) else {
            return Ok(());
        };

        for child in &view_info.children {
            if let Some(commit) = round.commits.get(child) {
                round.v_hat = suite.point_add(&round.v_hat, &commit.v_hat);
                round.x_hat = suite.point_add(&round.x_hat, &commit.x_hat);
            }
        }
        round.commit_exceptions.extend(missing_keys);

        if let Some(vote) = round.vote.as_mut() {
            let response = VoteResponse {
                name: self.name.clone(),
                accepted: self.app.accept_vote(vote),
                signature: self.keypair.sign(suite, &vote.proposal_bytes()),
            };
            vote.count.add(response);
        }

        if merkle {
            let hashed_log = hash_log(suite, &round.big_v, &round.v_hat);
            let mut leaves: Vec<Vec<u8>> = round
                .commits
                .values()
                .map(|commit| commit.mt_root.clone())
                .filter(|root| !root.is_empty())
                .collect();
            leaves.extend(local_leaf.iter().cloned());
            let tree = CombinedTree::build(suite, leaves, hashed_log);
            let child_proofs = tree.separate_proofs(round.commits.iter().map(|(name, commit)| (name, &commit.mt_root)));
            round.local_proof = local_leaf.as_ref().and_then(|leaf| tree.proof_for(leaf).cloned());
            round.child_proofs = child_proofs;
            round.mt_root = tree.root.clone();
            round.local_leaf = local_leaf;
            round.tree = Some(tree);
        }
        round.phase = RoundPhase::Committed;

        self.act_on_commits(round_no, &view_info)
    }

    fn act_on_commits(&mut self, round_no: RoundNumber, view_info: &View) -> Result<(), SignError> {
        let Some(round) = self.rounds.get(&round_no) else {
            return Ok(());
        };
        let view = round.view;
        let is_vote_round = round.is_vote_round();
        let suite = &self.suite;
        let com = CommitmentMessage {
            v: EncodedPoint::new(suite, &round.big_v),
            v_hat: EncodedPoint::new(suite, &round.v_hat),
            x_hat: EncodedPoint::new(suite, &round.x_hat),
            mt_root: round.mt_root.clone(),
            exception_list: round.commit_exceptions.iter().map(|key| EncodedPoint::new(suite, key)).collect(),
            vote: round.vote.clone(),
            round: round_no,
        };
        self.publish(Event::Commit(CommitEvent {
            timestamp: SystemTime::now(),
            view,
            round: round_no,
            children_committed: round.commits.len(),
            children: view_info.children.len(),
        }));

        if view_info.is_root(&self.name) {
            return self.finalize_commits(round_no);
        }
        if !is_vote_round && self.fail_at(view, round_no, Phase::Commit) {
            return Ok(());
        }
        self.put_up(view, Payload::Commitment(com))
    }

    /// Root only: derive the collective challenge `c = H(message, V_hat)` and start the Challenge phase.
    pub(crate) fn finalize_commits(&mut self, round_no: RoundNumber) -> Result<(), SignError> {
        let signing_mode = self.params.signing_mode;
        let suite = &self.suite;
        let Some(round) = self.rounds.get_mut(&round_no) else {
            return Ok(());
        };
        let message = match (&round.vote, signing_mode) {
            (Some(vote), _) => vote.bytes(),
            (None, SigningMode::MerkleTree) => round.mt_root.clone(),
            (None, SigningMode::PubKey) => round.log_test.clone(),
        };
        let c = challenge(suite, &message, &round.v_hat);
        round.signed_message = message;

        let view = round.view;
        let chm = ChallengeMessage {
            c: EncodedScalar::new(suite, &c),
            mt_root: round.mt_root.clone(),
            proof: Proof::new(),
            round: round_no,
            vote: round.vote.clone(),
        };
        self.challenge(view, chm)
    }

    /// Challenge phase: record `c`, hand inclusion proofs to the application and the children, compute
    /// this node's response.
    pub(crate) fn challenge(&mut self, view: ViewNumber, chm: ChallengeMessage) -> Result<(), SignError> {
        self.update_last_seen_round(chm.round);
        let round_no = chm.round;
        let round_view = match self.rounds.get(&round_no) {
            Some(round) if round.phase == RoundPhase::Committed => round.view,
            Some(_) => return Ok(()),
            None => {
                log::debug!("{}: challenge for unknown round {} in view {}", self.name, round_no, view);
                return Ok(());
            }
        };
        let c = chm.c.decode(&self.suite)?;
        let view_info = self.view_snapshot(round_view)?;

        if let Some(vote) = &chm.vote {
            if let Some(round) = self.rounds.get_mut(&round_no) {
                round.vote = Some(vote.clone());
            }
            self.act_on_votes(round_view, vote.clone())?;
        }

        let merkle = chm.vote.is_none() && self.params.signing_mode == SigningMode::MerkleTree;
        let response_deadline = Instant::now() + self.phase_deadline(&view_info);
        let suite = &self.suite;
        let Some(round) = self.rounds.get_mut(&round_no) else {
            return Ok(());
        };

        let r = suite.scalar_sub(&round.v, &suite.scalar_mul(self.keypair.secret(), &c));
        round.c = Some(c);
        round.r_hat = Some(r.clone());
        round.r = Some(r);
        round.response_deadline = Some(response_deadline);
        round.phase = RoundPhase::Challenged;

        let outgoing: Vec<(NodeName, ChallengeMessage)> = view_info
            .children
            .iter()
            .map(|child| {
                let mut proof = chm.proof.clone();
                if merkle {
                    proof.extend(round.child_proofs.get(child).cloned().unwrap_or_default());
                }
                let message = ChallengeMessage {
                    c: chm.c.clone(),
                    mt_root: chm.mt_root.clone(),
                    proof,
                    round: round_no,
                    vote: chm.vote.clone(),
                };
                (child.clone(), message)
            })
            .collect();
        let local_done = match (merkle, &round.local_leaf, &round.local_proof) {
            (true, Some(leaf), Some(segment)) => {
                let proof: Proof = chm.proof.iter().chain(segment).cloned().collect();
                Some((leaf.clone(), proof))
            }
            _ => None,
        };

        if let Some((leaf, proof)) = local_done {
            // A node its parent left out at commit time has no path into the collective root.
            if check_proof(&self.suite, &chm.mt_root, &leaf, &proof) {
                self.app.done(round_view, &leaf, &chm.mt_root, &proof);
            } else {
                log::info!("{}: round {} leaf is not in collective root", self.name, round_no);
            }
        }
        self.publish(Event::Challenge(ChallengeEvent {
            timestamp: SystemTime::now(),
            view: round_view,
            round: round_no,
            collective_root: chm.mt_root.clone(),
        }));
        for (child, message) in outgoing {
            self.put_to(&child, round_view, Payload::Challenge(message))?;
        }

        if view_info.is_leaf() {
            self.respond(round_no, None)?;
        }
        Ok(())
    }

    /// Respond phase. Buffers `response` and, once every child is accounted for, aggregates.
    pub(crate) fn respond(
        &mut self,
        round_no: RoundNumber,
        response: Option<(NodeName, ResponseMessage)>,
    ) -> Result<(), SignError> {
        self.update_last_seen_round(round_no);
        let round_view = match self.rounds.get(&round_no) {
            Some(round) if round.phase == RoundPhase::Challenged => round.view,
            _ => return Ok(()),
        };
        let view_info = self.view_snapshot(round_view)?;

        if let Some((from, rm)) = response {
            let suite = &self.suite;
            let child = ChildResponse {
                r_hat: rm.r_hat.decode(suite)?,
                exception_list: rm
                    .exception_list
                    .iter()
                    .map(|key| key.decode(suite))
                    .collect::<Result<Vec<_>, _>>()?,
                exception_v_hat: rm.exception_v_hat.decode(suite)?,
                exception_x_hat: rm.exception_x_hat.decode(suite)?,
            };
            if let Some(round) = self.rounds.get_mut(&round_no) {
                round.responses.entry(from).or_insert(child);
            }
        }

        // Children that never committed are defaults already; their responses are not waited for.
        let resolved = self.rounds.get(&round_no).map_or(0, |round| {
            view_info
                .children
                .iter()
                .filter(|child| !round.committed(child) || round.responses.contains_key(*child))
                .count()
        });
        if resolved < view_info.children.len() {
            return Ok(());
        }
        self.finish_responses(round_no)
    }

    /// Resolve every child slot: a real response from a child that committed is aggregated; anything else
    /// is a default, which excludes the child's whole subtree.
    pub(crate) fn finish_responses(&mut self, round_no: RoundNumber) -> Result<(), SignError> {
        let round_view = match self.rounds.get(&round_no) {
            Some(round) if round.phase == RoundPhase::Challenged => round.view,
            _ => return Ok(()),
        };
        let view_info = self.view_snapshot(round_view)?;

        let defaults: HashMap<NodeName, Vec<S::Point>> = {
            let round = &self.rounds[&round_no];
            view_info
                .children
                .iter()
                .filter(|child| !(round.committed(child) && round.responses.contains_key(*child)))
                .map(|child| (child.clone(), self.subtree_keys(&view_info, child)))
                .collect()
        };
        if !defaults.is_empty() {
            log::info!(
                "{}: round {} excluding {:?}",
                self.name,
                round_no,
                defaults.keys().collect::<Vec<_>>()
            );
        }

        let suite = &self.suite;
        let Some(round) = self.rounds.get_mut(&round_no) else {
            return Ok(());
        };
        let mut r_hat = round.r.clone().unwrap_or_else(|| suite.zero_scalar());
        let mut exception_v_hat = suite.null_point();
        let mut exception_x_hat = suite.null_point();
        let mut exception_list = Vec::new();

        for child in &view_info.children {
            if let Some(keys) = defaults.get(child) {
                exception_list.extend(keys.iter().cloned());
                if let Some(commit) = round.commits.get(child) {
                    exception_v_hat = suite.point_add(&exception_v_hat, &commit.v_hat);
                    exception_x_hat = suite.point_add(&exception_x_hat, &commit.x_hat);
                }
            } else if let Some(response) = round.responses.get(child) {
                r_hat = suite.scalar_add(&r_hat, &response.r_hat);
                exception_v_hat = suite.point_add(&exception_v_hat, &response.exception_v_hat);
                exception_x_hat = suite.point_add(&exception_x_hat, &response.exception_x_hat);
                exception_list.extend(response.exception_list.iter().cloned());
            }
        }

        round.x_hat = suite.point_sub(&round.x_hat, &exception_x_hat);
        round.r_hat = Some(r_hat);
        round.exception_v_hat = exception_v_hat;
        round.exception_x_hat = exception_x_hat;
        round.exception_list = exception_list;
        round.phase = RoundPhase::Responded;

        self.act_on_responses(round_no, &view_info)
    }

    fn act_on_responses(&mut self, round_no: RoundNumber, view_info: &View) -> Result<(), SignError> {
        let verified = self.verify_responses(round_no, view_info);
        let Some(round) = self.rounds.remove(&round_no) else {
            return Ok(());
        };
        let view = round.view;
        let is_vote_round = round.is_vote_round();
        let suite = &self.suite;
        let c = round.c.clone().unwrap_or_else(|| suite.zero_scalar());
        let r_hat = round.r_hat.clone().unwrap_or_else(|| suite.zero_scalar());
        let exception_list: Vec<EncodedPoint> = round
            .exception_list
            .iter()
            .map(|key| EncodedPoint::new(suite, key))
            .collect();
        self.publish(Event::Respond(RespondEvent {
            timestamp: SystemTime::now(),
            view,
            round: round_no,
            exceptions: exception_list.len(),
            verified,
        }));

        if view_info.is_root(&self.name) {
            let signature = CollectiveSignature {
                view,
                round: round_no,
                message: round.signed_message,
                challenge: EncodedScalar::new(suite, &c),
                response: EncodedScalar::new(suite, &r_hat),
                commitment: EncodedPoint::new(suite, &round.v_hat),
                aggregate_public: EncodedPoint::new(suite, &round.x_hat),
                exception_list,
                exception_commitment: EncodedPoint::new(suite, &round.exception_v_hat),
            };
            log::info!(
                "{}: round {} done in view {} with {} of {} nodes excepted",
                self.name,
                round_no,
                view,
                signature.exception_list.len(),
                view_info.host_list.len()
            );
            self.app.round_done(view, &signature);
            self.publish(Event::RoundDone(RoundDoneEvent {
                timestamp: SystemTime::now(),
                round_type: round.round_type,
                signature,
                verified,
            }));
        } else {
            let rm = ResponseMessage {
                r_hat: EncodedScalar::new(suite, &r_hat),
                exception_list,
                exception_v_hat: EncodedPoint::new(suite, &round.exception_v_hat),
                exception_x_hat: EncodedPoint::new(suite, &round.exception_x_hat),
                round: round_no,
                vote: round.vote.clone(),
            };
            if is_vote_round || !self.fail_at(view, round_no, Phase::Respond) {
                self.put_up(view, Payload::Response(rm))?;
            }
        }

        if !is_vote_round && self.time_for_view_change(round_no) {
            let next = self.view() + 1;
            if let Err(err) = self.try_view_change(next) {
                log::debug!("{}: scheduled view change to {} not started: {}", self.name, next, err);
            }
        }
        Ok(())
    }

    /// Check `g^r_hat + c*X_hat + exception_V_hat == V_hat`, and at the root also that the challenge
    /// recomputed from that point matches. A mismatch is reported, not returned.
    pub(crate) fn verify_responses(&self, round_no: RoundNumber, view_info: &View) -> bool {
        let Some(round) = self.rounds.get(&round_no) else {
            return false;
        };
        let suite = &self.suite;
        let (Some(c), Some(r_hat)) = (&round.c, &round.r_hat) else {
            return false;
        };

        let t = suite.point_add(
            &suite.point_add(&suite.base_mul(r_hat), &suite.point_mul(&round.x_hat, c)),
            &round.exception_v_hat,
        );
        let mut verified = t == round.v_hat && round.check_local_proofs(suite);
        if view_info.is_root(&self.name) {
            let c1 = challenge(suite, &round.signed_message, &round.v_hat);
            let c2 = challenge(suite, &round.signed_message, &t);
            verified &= &c1 == c && c1 == c2;
        }

        if !verified {
            log::error!("{}: round {} failed verification in view {}", self.name, round_no, round.view);
            self.publish(Event::VerificationFailed(VerificationFailedEvent {
                timestamp: SystemTime::now(),
                view: round.view,
                round: round_no,
            }));
            if self.params.assert_verification {
                debug_assert!(verified, "round {} failed verification", round_no);
            }
        }
        verified
    }

    /// Resolve every phase whose deadline passed by `now`, treating silent children as defaults.
    pub(crate) fn expire_phases(&mut self, now: Instant) {
        let due_commits: Vec<RoundNumber> = self
            .rounds
            .values()
            .filter(|round| round.phase == RoundPhase::Announced && round.commit_deadline <= now)
            .map(|round| round.number)
            .collect();
        let due_responses: Vec<RoundNumber> = self
            .rounds
            .values()
            .filter(|round| {
                round.phase == RoundPhase::Challenged
                    && round.response_deadline.map_or(false, |deadline| deadline <= now)
            })
            .map(|round| round.number)
            .collect();

        for round_no in due_commits {
            log::debug!("{}: commit deadline of round {} passed", self.name, round_no);
            if let Err(err) = self.finish_commits(round_no) {
                log::warn!("{}: round {} could not finish commit: {}", self.name, round_no, err);
            }
        }
        for round_no in due_responses {
            log::debug!("{}: response deadline of round {} passed", self.name, round_no);
            if let Err(err) = self.finish_responses(round_no) {
                log::warn!("{}: round {} could not finish response: {}", self.name, round_no, err);
            }
        }
    }
}
