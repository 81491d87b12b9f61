//! Profile-data gatherer
//!
//! Produces the immutable, compile-time-safe snapshot a work item carries:
//! classified inline caches, constructor caches, and nested records for
//! every function the inlining policy chooses to inline. The gatherer runs
//! on the foreground thread and clones everything it needs out of the
//! runtime profile under its lock, so interpreter execution concurrently
//! updating the original cannot corrupt the snapshot mid-read.

use crate::data::{
    CacheClassification, CodeGenData, GatherStats, JitTimeCallSite, JitTimeInlineCache,
    ObjTypeSpecRecord,
};
use brio_core::{
    CacheKind, CallSiteId, FunctionBody, FunctionInstance, PropertyId, ScriptContext, Speculation,
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tracing::trace;

/// Heuristics bounding the inline tree.
#[derive(Debug, Clone)]
pub struct InliningPolicy {
    /// Total bytecode bytes of inlinees admitted under one top function.
    pub budget_bytes: u32,
    /// Maximum inline nesting depth.
    pub max_depth: u32,
    /// Call sites with more distinct callees than this are not inlined.
    pub polymorphic_limit: usize,
    /// Minimum observed calls through a site before inlining it.
    pub min_calls_to_inline: u64,
}

impl Default for InliningPolicy {
    fn default() -> Self {
        Self {
            budget_bytes: 4096,
            max_depth: 4,
            polymorphic_limit: 4,
            min_calls_to_inline: 2,
        }
    }
}

impl InliningPolicy {
    /// Maximally permissive variant used by the aggressive first pass.
    fn permissive(&self) -> InliningPolicy {
        InliningPolicy {
            budget_bytes: u32::MAX,
            max_depth: AGGRESSIVE_DEPTH_BOUND,
            polymorphic_limit: self.polymorphic_limit,
            min_calls_to_inline: 1,
        }
    }
}

/// Hard recursion bound for the speculative aggressive walk; terminates
/// the walk even for mutually-recursive inline candidates.
const AGGRESSIVE_DEPTH_BOUND: u32 = 8;

/// The aggressive walk hit a disallowed construct partway through.
struct AggressiveBailout {
    /// Carried over into the default-heuristics fallback rather than
    /// restarting the observation from nothing.
    highest_loop_inlinee_count: u32,
}

/// Assemble the frozen snapshot for `body`, recursing over inlining
/// decisions. `top_body` attributes the walk for tracing; `live` supplies
/// per-closure inline caches that may be fresher than the shared
/// body-level ones.
pub fn gather_codegen_data(
    ctx: &ScriptContext,
    top_body: &Arc<FunctionBody>,
    body: &Arc<FunctionBody>,
    policy: &InliningPolicy,
    aggressive: bool,
    live: Option<&FunctionInstance>,
) -> Arc<CodeGenData> {
    let mut gatherer = Gatherer {
        ctx,
        top_body,
        rebind_next: 0,
    };

    let (policy, carried_highest) = if aggressive {
        // First pass: speculative walk of the entire prospective inline
        // tree with permissive heuristics. No side effects.
        match gatherer.speculative_walk(body, 0) {
            Ok(highest) => {
                trace!(top = top_body.id.0, "aggressive inlining walk succeeded");
                (policy.permissive(), highest)
            }
            Err(bailout) => {
                trace!(
                    top = top_body.id.0,
                    "aggressive inlining abandoned, falling back to default heuristics"
                );
                (policy.clone(), bailout.highest_loop_inlinee_count)
            }
        }
    } else {
        (policy.clone(), 0)
    };

    let mut budget = policy.budget_bytes;
    let mut data = gatherer.gather_one(body, &policy, live, 0, &mut budget);
    data.highest_loop_inlinee_count = data.highest_loop_inlinee_count.max(carried_highest);
    Arc::new(data)
}

struct Gatherer<'a> {
    ctx: &'a ScriptContext,
    top_body: &'a Arc<FunctionBody>,
    /// Counter for snapshot-private property id rebinding.
    rebind_next: u32,
}

impl Gatherer<'_> {
    fn fresh_property_id(&mut self) -> PropertyId {
        let id = self.rebind_next;
        self.rebind_next += 1;
        PropertyId(id)
    }

    /// Walk the whole prospective inline tree with permissive limits to
    /// see whether it can be fully inlined. Returns the highest
    /// loop-inlinee count observed; bails on the first disallowed
    /// construct.
    fn speculative_walk(
        &self,
        body: &Arc<FunctionBody>,
        depth: u32,
    ) -> Result<u32, AggressiveBailout> {
        if depth >= AGGRESSIVE_DEPTH_BOUND {
            return Ok(0);
        }

        let call_sites: Vec<_> = {
            let profile = body.profile().read();
            profile.call_sites.values().cloned().collect()
        };

        let mut loop_inlinees = 0u32;
        let mut highest = 0u32;
        for site in &call_sites {
            if site.polymorphism() == 0 {
                continue;
            }
            if site.polymorphism() > 1 {
                // Uninlinable polymorphic call site.
                return Err(AggressiveBailout {
                    highest_loop_inlinee_count: highest.max(loop_inlinees),
                });
            }
            let Some(callee) = self.ctx.function(site.callees[0]) else {
                continue;
            };
            if !callee.attributes.is_inlinable || callee.attributes.has_try {
                continue;
            }
            if callee.attributes.has_switch {
                // Disallowed construct in a candidate inlinee.
                return Err(AggressiveBailout {
                    highest_loop_inlinee_count: highest.max(loop_inlinees),
                });
            }
            if !callee.loop_headers().is_empty() {
                loop_inlinees += 1;
            }
            highest = highest.max(self.speculative_walk(&callee, depth + 1)?);
        }
        Ok(highest.max(loop_inlinees))
    }

    fn gather_one(
        &mut self,
        body: &Arc<FunctionBody>,
        policy: &InliningPolicy,
        live: Option<&FunctionInstance>,
        depth: u32,
        budget: &mut u32,
    ) -> CodeGenData {
        // Clone what we need out of the live profile in one read section;
        // the interpreter keeps updating the original afterwards.
        let (caches, call_sites, ctor_caches, saw_int_overflow) = {
            let profile = body.profile().read();
            let caches: Vec<(CallSiteId, brio_core::InlineCache)> = profile
                .inline_caches
                .iter()
                .map(|(&site, cache)| {
                    let cache = live
                        .and_then(|f| f.closure_cache(site))
                        .unwrap_or_else(|| cache.clone());
                    (site, cache)
                })
                .collect();
            let call_sites: Vec<(CallSiteId, brio_core::profile::CallSiteProfile)> = profile
                .call_sites
                .iter()
                .map(|(&site, cs)| (site, cs.clone()))
                .collect();
            let ctor_caches: Vec<_> = profile
                .ctor_caches
                .iter()
                .map(|(&site, &(prop, ty))| (site, prop, ty))
                .collect();
            (caches, call_sites, ctor_caches, profile.saw_int_overflow())
        };

        // Index properties seen as own slots vs accessors. A property seen
        // both ways marks its sites as accessor conflicts: inlining a
        // getter/setter and a subsequent apply/call dispatch on the same
        // syntactic access is unsound.
        let mut kinds_by_property: FxHashMap<PropertyId, (bool, bool)> = FxHashMap::default();
        for (_, cache) in &caches {
            let entry = kinds_by_property.entry(cache.property_id).or_default();
            match cache.kind {
                CacheKind::OwnSlot => entry.0 = true,
                CacheKind::Accessor => entry.1 = true,
            }
        }
        let conflicted: FxHashSet<PropertyId> = kinds_by_property
            .iter()
            .filter(|(_, &(own, accessor))| own && accessor)
            .map(|(&prop, _)| prop)
            .collect();

        let speculations = body.speculations();
        let mut stats = GatherStats::default();
        let mut accessor_conflicts = Vec::new();
        let mut jit_caches = Vec::with_capacity(caches.len());
        for (site, cache) in &caches {
            if conflicted.contains(&cache.property_id) {
                accessor_conflicts.push(*site);
            }
            let classification = classify(cache, &mut stats);
            let obj_type_spec = match &classification {
                CacheClassification::Monomorphic(ty)
                    if !speculations.is_disabled(Speculation::ObjTypeSpec) =>
                {
                    Some(ObjTypeSpecRecord {
                        guard_type: *ty,
                        equivalent_types: Vec::new(),
                    })
                }
                CacheClassification::Polymorphic(types)
                    if !speculations.is_disabled(Speculation::EquivObjTypeSpec)
                        && types.len() <= policy.polymorphic_limit =>
                {
                    Some(ObjTypeSpecRecord {
                        guard_type: types[0],
                        equivalent_types: types.clone(),
                    })
                }
                _ => None,
            };
            let rebound = self.fresh_property_id();
            jit_caches.push(JitTimeInlineCache {
                site: *site,
                property_id: rebound,
                kind: cache.kind,
                classification,
                obj_type_spec,
            });
        }

        let mut loop_inlinees = 0u32;
        let mut highest = 0u32;
        let mut jit_sites = Vec::with_capacity(call_sites.len());
        for (site, cs) in &call_sites {
            let mut inlinee = None;
            if !accessor_conflicts.contains(site) {
                if let Some(callee) = self.inline_candidate(cs, policy, depth, budget) {
                    *budget = budget.saturating_sub(callee.bytecode_len_bytes);
                    if !callee.loop_headers().is_empty() {
                        loop_inlinees += 1;
                    }
                    // Closures are specific to the top function; inlinees
                    // use their shared body-level caches.
                    let inner = self.gather_one(&callee, policy, None, depth + 1, budget);
                    highest = highest.max(inner.highest_loop_inlinee_count);
                    inlinee = Some(Box::new(inner));
                }
            }
            jit_sites.push(JitTimeCallSite {
                site: *site,
                fan_out: cs.polymorphism(),
                inlinee,
            });
        }

        trace!(
            top = self.top_body.id.0,
            function = body.id.0,
            mono = stats.monomorphic,
            poly = stats.polymorphic,
            no_info = stats.no_info,
            "gathered codegen data"
        );

        CodeGenData {
            function: body.id,
            inline_caches: jit_caches,
            call_sites: jit_sites,
            ctor_caches,
            saw_int_overflow,
            stats,
            highest_loop_inlinee_count: highest.max(loop_inlinees),
            accessor_conflicts,
        }
    }

    fn inline_candidate(
        &self,
        cs: &brio_core::profile::CallSiteProfile,
        policy: &InliningPolicy,
        depth: u32,
        budget: &u32,
    ) -> Option<Arc<FunctionBody>> {
        if depth >= policy.max_depth || cs.count < policy.min_calls_to_inline {
            return None;
        }
        // Only monomorphic sites are inlined; polymorphic sites within the
        // fan-out limit still get equivalent-type guards on their caches.
        if cs.polymorphism() != 1 {
            return None;
        }
        let callee = self.ctx.function(cs.callees[0])?;
        if !callee.attributes.is_inlinable || callee.attributes.has_try {
            return None;
        }
        if callee.bytecode_len_bytes > *budget {
            return None;
        }
        Some(callee)
    }
}

fn classify(cache: &brio_core::InlineCache, stats: &mut GatherStats) -> CacheClassification {
    match cache.types.len() {
        0 if cache.profiled => {
            stats.empty += 1;
            CacheClassification::Empty
        }
        0 => {
            stats.no_info += 1;
            CacheClassification::NoInfo
        }
        1 => {
            stats.monomorphic += 1;
            CacheClassification::Monomorphic(cache.types[0])
        }
        _ => {
            stats.polymorphic += 1;
            CacheClassification::Polymorphic(cache.types.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brio_core::function_body::FunctionAttributes;
    use brio_core::{FunctionId, InlineCache, LoopId, TypeId};
    use brio_core::function_body::LoopHeader;

    fn make_body(
        ctx: &ScriptContext,
        id: u32,
        len: u32,
        attrs: FunctionAttributes,
        loops: usize,
    ) -> Arc<FunctionBody> {
        let headers = (0..loops)
            .map(|i| LoopHeader {
                id: LoopId(i as u32),
                locals: Vec::new(),
            })
            .collect();
        let body = Arc::new(FunctionBody::new(
            FunctionId(id),
            format!("f{id}"),
            len,
            len / 4,
            attrs,
            headers,
        ));
        ctx.register_function(Arc::clone(&body));
        body
    }

    fn inlinable() -> FunctionAttributes {
        FunctionAttributes {
            is_inlinable: true,
            ..FunctionAttributes::default()
        }
    }

    #[test]
    fn classification_tallies_no_info_separately_from_polymorphic() {
        let ctx = ScriptContext::new();
        let body = make_body(&ctx, 1, 100, FunctionAttributes::default(), 0);
        {
            let mut profile = body.profile().write();
            let mut mono = InlineCache::new(PropertyId(1), CacheKind::OwnSlot);
            mono.record_type(TypeId(0xa));
            profile.inline_caches.insert(CallSiteId(0), mono);

            let mut poly = InlineCache::new(PropertyId(2), CacheKind::OwnSlot);
            poly.record_type(TypeId(0xa));
            poly.record_type(TypeId(0xb));
            profile.inline_caches.insert(CallSiteId(1), poly);

            let mut empty = InlineCache::new(PropertyId(3), CacheKind::OwnSlot);
            empty.record_execution();
            profile.inline_caches.insert(CallSiteId(2), empty);

            let no_info = InlineCache::new(PropertyId(4), CacheKind::OwnSlot);
            profile.inline_caches.insert(CallSiteId(3), no_info);
        }

        let data = gather_codegen_data(
            &ctx,
            &body,
            &body,
            &InliningPolicy::default(),
            false,
            None,
        );
        assert_eq!(data.stats.monomorphic, 1);
        assert_eq!(data.stats.polymorphic, 1);
        assert_eq!(data.stats.empty, 1);
        assert_eq!(data.stats.no_info, 1);
    }

    #[test]
    fn snapshot_is_isolated_from_later_profile_updates() {
        let ctx = ScriptContext::new();
        let body = make_body(&ctx, 1, 100, FunctionAttributes::default(), 0);
        {
            let mut profile = body.profile().write();
            let mut cache = InlineCache::new(PropertyId(1), CacheKind::OwnSlot);
            cache.record_type(TypeId(0xa));
            profile.inline_caches.insert(CallSiteId(0), cache);
        }
        let data = gather_codegen_data(
            &ctx,
            &body,
            &body,
            &InliningPolicy::default(),
            false,
            None,
        );

        // Interpreter keeps going; the cache turns polymorphic.
        body.profile()
            .write()
            .inline_caches
            .get_mut(&CallSiteId(0))
            .unwrap()
            .record_type(TypeId(0xb));

        assert!(matches!(
            data.inline_caches[0].classification,
            CacheClassification::Monomorphic(TypeId(0xa))
        ));
    }

    #[test]
    fn monomorphic_hot_sites_get_inlined_recursively() {
        let ctx = ScriptContext::new();
        let top = make_body(&ctx, 1, 200, FunctionAttributes::default(), 0);
        let mid = make_body(&ctx, 2, 100, inlinable(), 0);
        let leaf = make_body(&ctx, 3, 50, inlinable(), 0);
        for (body, callee) in [(&top, &mid), (&mid, &leaf)] {
            let mut profile = body.profile().write();
            let cs = profile.call_sites.entry(CallSiteId(0)).or_default();
            for _ in 0..10 {
                cs.record_callee(callee.id);
            }
        }

        let data = gather_codegen_data(
            &ctx,
            &top,
            &top,
            &InliningPolicy::default(),
            false,
            None,
        );
        assert_eq!(data.inlinee_count(), 2);
    }

    #[test]
    fn inline_budget_is_shared_across_the_tree() {
        let ctx = ScriptContext::new();
        let top = make_body(&ctx, 1, 200, FunctionAttributes::default(), 0);
        let big = make_body(&ctx, 2, 5000, inlinable(), 0);
        {
            let mut profile = top.profile().write();
            let cs = profile.call_sites.entry(CallSiteId(0)).or_default();
            for _ in 0..10 {
                cs.record_callee(big.id);
            }
        }
        let data = gather_codegen_data(
            &ctx,
            &top,
            &top,
            &InliningPolicy::default(),
            false,
            None,
        );
        assert_eq!(data.inlinee_count(), 0);
    }

    #[test]
    fn aggressive_walk_bails_on_switch_and_carries_loop_count() {
        let ctx = ScriptContext::new();
        let top = make_body(&ctx, 1, 200, FunctionAttributes::default(), 0);
        let loopy = make_body(&ctx, 2, 100, inlinable(), 2);
        let switchy = make_body(
            &ctx,
            3,
            100,
            FunctionAttributes {
                is_inlinable: true,
                has_switch: true,
                ..FunctionAttributes::default()
            },
            0,
        );
        {
            let mut profile = top.profile().write();
            for (site, callee) in [(CallSiteId(0), &loopy), (CallSiteId(1), &switchy)] {
                let cs = profile.call_sites.entry(site).or_default();
                for _ in 0..10 {
                    cs.record_callee(callee.id);
                }
            }
        }

        let data = gather_codegen_data(&ctx, &top, &top, &InliningPolicy::default(), true, None);
        // The aggressive pass abandoned partway, but the loop-inlinee
        // observation survived the fallback.
        assert!(data.highest_loop_inlinee_count >= 1);
    }

    #[test]
    fn aggressive_walk_terminates_on_mutual_recursion() {
        let ctx = ScriptContext::new();
        let a = make_body(&ctx, 1, 100, inlinable(), 0);
        let b = make_body(&ctx, 2, 100, inlinable(), 0);
        for (body, callee) in [(&a, &b), (&b, &a)] {
            let mut profile = body.profile().write();
            let cs = profile.call_sites.entry(CallSiteId(0)).or_default();
            for _ in 0..10 {
                cs.record_callee(callee.id);
            }
        }
        // Must terminate; depth bound caps the walk.
        let data = gather_codegen_data(&ctx, &a, &a, &InliningPolicy::default(), true, None);
        assert!(data.inlinee_count() <= AGGRESSIVE_DEPTH_BOUND as usize);
    }

    #[test]
    fn accessor_conflicts_suppress_inlining() {
        let ctx = ScriptContext::new();
        let top = make_body(&ctx, 1, 200, FunctionAttributes::default(), 0);
        let callee = make_body(&ctx, 2, 50, inlinable(), 0);
        {
            let mut profile = top.profile().write();
            // Same property via own slot at site 0 and via accessor at
            // site 1.
            let mut own = InlineCache::new(PropertyId(7), CacheKind::OwnSlot);
            own.record_type(TypeId(0xa));
            profile.inline_caches.insert(CallSiteId(0), own);
            let mut accessor = InlineCache::new(PropertyId(7), CacheKind::Accessor);
            accessor.record_type(TypeId(0xa));
            profile.inline_caches.insert(CallSiteId(1), accessor);

            let cs = profile.call_sites.entry(CallSiteId(0)).or_default();
            for _ in 0..10 {
                cs.record_callee(callee.id);
            }
        }
        let data = gather_codegen_data(
            &ctx,
            &top,
            &top,
            &InliningPolicy::default(),
            false,
            None,
        );
        assert!(data.accessor_conflicts.contains(&CallSiteId(0)));
        assert_eq!(data.inlinee_count(), 0);
    }

    #[test]
    fn live_closure_caches_override_shared_ones() {
        let ctx = ScriptContext::new();
        let body = make_body(&ctx, 1, 100, FunctionAttributes::default(), 0);
        {
            let mut profile = body.profile().write();
            let mut shared = InlineCache::new(PropertyId(1), CacheKind::OwnSlot);
            shared.record_type(TypeId(0xa));
            shared.record_type(TypeId(0xb));
            profile.inline_caches.insert(CallSiteId(0), shared);
        }
        let instance = FunctionInstance::new(Arc::clone(&body));
        let mut fresh = InlineCache::new(PropertyId(1), CacheKind::OwnSlot);
        fresh.record_type(TypeId(0xb));
        instance.record_closure_cache(CallSiteId(0), fresh);

        let data = gather_codegen_data(
            &ctx,
            &body,
            &body,
            &InliningPolicy::default(),
            false,
            Some(&instance),
        );
        // The closure cache was monomorphic even though the shared one
        // had gone polymorphic.
        assert!(matches!(
            data.inline_caches[0].classification,
            CacheClassification::Monomorphic(TypeId(0xb))
        ));
        assert_eq!(data.stats.monomorphic, 1);
    }
}
