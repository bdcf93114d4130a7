//! Refinement state accumulated over one equivalence query.
//!
//! Every registration only ever adds information: buffer identity overrides
//! are never removed and precision windows only grow. The registration
//! functions report whether anything new was recorded, which the
//! equivalence loop uses to detect a refinement that made no progress.

use std::collections::HashMap;

use equiv_ir::{CmdPointer, Var};
use indexmap::IndexMap;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::instrumentation::{
    BufferIdentity, InclusionMode, InstrumentationControl, TraceTarget, UseSiteControl,
};
use crate::rule_generator::{shared_var, Side};

/// A site of B whose buffer takes `agreed` whenever `flag_a` holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairwiseAgreement {
    pub flag_a: Var,
    pub agreed: u64,
}

/// Forced buffer identity of a site of A.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteAOverride {
    pub manual: u64,
    pub reached: Var,
}

/// Serializable snapshot of a [`PairwiseProofManager`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memento {
    pub a_site_overrides: Vec<(CmdPointer, SiteAOverride)>,
    pub b_site_partners: Vec<(CmdPointer, Vec<PairwiseAgreement>)>,
    pub next_site: u64,
    pub a_load_windows: Vec<(CmdPointer, u32)>,
    pub b_load_windows: Vec<(CmdPointer, u32)>,
    pub a_reached: Vec<(CmdPointer, Var)>,
}

#[derive(Debug, Clone, Default)]
pub struct PairwiseProofManager {
    a_site_overrides: IndexMap<CmdPointer, SiteAOverride>,
    b_site_partners: IndexMap<CmdPointer, Vec<PairwiseAgreement>>,
    a_load_windows: HashMap<CmdPointer, u32>,
    b_load_windows: HashMap<CmdPointer, u32>,
    a_reached: IndexMap<CmdPointer, Var>,
    next_site: u64,
}

impl PairwiseProofManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh(&mut self) -> u64 {
        let n = self.next_site;
        self.next_site += 1;
        n
    }

    fn a_reach(&mut self, site: CmdPointer) -> Var {
        if let Some(v) = self.a_reached.get(&site) {
            return v.clone();
        }
        let n = self.fresh();
        let v = shared_var(&Var::bool(format!("site!reached!{n}")));
        self.a_reached.insert(site, v.clone());
        v
    }

    fn a_override(&mut self, site: CmdPointer) -> SiteAOverride {
        if let Some(o) = self.a_site_overrides.get(&site) {
            return o.clone();
        }
        let reached = self.a_reach(site);
        let manual = self.fresh();
        let o = SiteAOverride { manual, reached };
        self.a_site_overrides.insert(site, o.clone());
        o
    }

    pub fn is_summarized(&self, a_site: CmdPointer) -> bool {
        self.a_site_overrides.contains_key(&a_site)
    }

    /// Give the buffer at `a_site` a fixed identity.
    pub fn force_summarized(&mut self, a_site: CmdPointer) -> bool {
        if self.is_summarized(a_site) {
            return false;
        }
        self.a_override(a_site);
        true
    }

    /// Record that the buffers read at `a_site` and `b_site` are equal.
    /// Returns false when the pairing was already known.
    pub fn register_pairwise_proof(&mut self, a_site: CmdPointer, b_site: CmdPointer) -> bool {
        let o = self.a_override(a_site);
        let agreement = PairwiseAgreement {
            flag_a: o.reached,
            agreed: o.manual,
        };
        let partners = self.b_site_partners.entry(b_site).or_default();
        if partners.contains(&agreement) {
            return false;
        }
        debug!(%a_site, %b_site, id = agreement.agreed, "registered buffer equivalence");
        partners.push(agreement);
        true
    }

    /// Raise the precision window of the load at `site` on `side` to
    /// `depth`. Returns false, leaving the state untouched, unless `depth`
    /// exceeds the recorded window.
    pub fn register_load_override(&mut self, side: Side, site: CmdPointer, depth: u32) -> bool {
        let windows = match side {
            Side::A => &mut self.a_load_windows,
            Side::B => &mut self.b_load_windows,
        };
        match windows.get(&site) {
            Some(current) if *current >= depth => false,
            _ => {
                windows.insert(site, depth);
                debug!(%side, %site, depth, "raised load precision window");
                true
            }
        }
    }

    pub fn register_a_load_override(&mut self, site: CmdPointer, depth: u32) -> bool {
        self.register_load_override(Side::A, site, depth)
    }

    pub fn register_b_load_override(&mut self, site: CmdPointer, depth: u32) -> bool {
        self.register_load_override(Side::B, site, depth)
    }

    pub fn load_windows(&self, side: Side) -> &HashMap<CmdPointer, u32> {
        match side {
            Side::A => &self.a_load_windows,
            Side::B => &self.b_load_windows,
        }
    }

    /// Buffer identity overrides of `side`.
    pub fn buffer_overrides(&self, side: Side) -> HashMap<CmdPointer, BufferIdentity> {
        match side {
            Side::A => self
                .a_site_overrides
                .iter()
                .map(|(site, o)| {
                    (
                        *site,
                        BufferIdentity::Forced {
                            id: BigInt::from(o.manual),
                            reached: o.reached.clone(),
                        },
                    )
                })
                .collect(),
            Side::B => self
                .b_site_partners
                .iter()
                .map(|(site, partners)| {
                    let cases = partners
                        .iter()
                        .map(|p| (p.flag_a.clone(), BigInt::from(p.agreed)))
                        .collect();
                    (*site, BufferIdentity::Conditional { cases })
                })
                .collect(),
        }
    }

    /// Instrumentation control of `side` reflecting everything registered.
    pub fn control(
        &self,
        side: Side,
        target: TraceTarget,
        mode: InclusionMode,
    ) -> InstrumentationControl {
        let mut control = InstrumentationControl::new(target, mode);
        for (site, identity) in self.buffer_overrides(side) {
            control = control.with_use_site(
                site,
                UseSiteControl {
                    track_buffer_contents: false,
                    identity: Some(identity),
                },
            );
        }
        control.load_windows = self.load_windows(side).clone();
        control
    }

    pub fn memento(&self) -> Memento {
        let mut a_load_windows: Vec<_> = self.a_load_windows.iter().map(|(k, v)| (*k, *v)).collect();
        let mut b_load_windows: Vec<_> = self.b_load_windows.iter().map(|(k, v)| (*k, *v)).collect();
        a_load_windows.sort();
        b_load_windows.sort();
        Memento {
            a_site_overrides: self
                .a_site_overrides
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            b_site_partners: self
                .b_site_partners
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            next_site: self.next_site,
            a_load_windows,
            b_load_windows,
            a_reached: self.a_reached.iter().map(|(k, v)| (*k, v.clone())).collect(),
        }
    }

    /// Merge a snapshot into this manager. The site counter never goes
    /// backwards, so identifiers minted since the snapshot stay fresh.
    pub fn restore(&mut self, m: &Memento) {
        self.next_site = self.next_site.max(m.next_site);
        self.a_site_overrides
            .extend(m.a_site_overrides.iter().cloned());
        for (site, partners) in &m.b_site_partners {
            let list = self.b_site_partners.entry(*site).or_default();
            for p in partners {
                if !list.contains(p) {
                    list.push(p.clone());
                }
            }
        }
        for (site, depth) in &m.a_load_windows {
            self.register_load_override(Side::A, *site, *depth);
        }
        for (site, depth) in &m.b_load_windows {
            self.register_load_override(Side::B, *site, *depth);
        }
        self.a_reached.extend(m.a_reached.iter().cloned());
    }
}
