//! Prompt compilation for the specialized agent roles.
//!
//! Every agent carries a baked-in fallback template; a [`PromptStore`]
//! implementation may serve a registry-managed override instead. Variables
//! use `{name}` placeholders and are expanded at compile time. Compiled
//! prompts are cached with a TTL (default 300 s) so a registry-backed store
//! is not re-consulted on every scene.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

// ---------------------------------------------------------------------------
// PromptStore trait
// ---------------------------------------------------------------------------

pub trait PromptStore: Send + Sync {
    /// Compile the named prompt with `vars`, falling back to `fallback`
    /// when the store has no template under that name.
    fn compile(&self, name: &str, vars: &HashMap<String, String>, fallback: &str) -> String;
}

/// Expand `{name}` placeholders.
pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
    let mut output = template.to_string();
    for (key, value) in vars {
        output = output.replace(&format!("{{{key}}}"), value);
    }
    output
}

// ---------------------------------------------------------------------------
// BuiltinPromptStore
// ---------------------------------------------------------------------------

/// Prompt store backed by registered templates plus the caller-supplied
/// fallbacks, with an LRU+TTL cache of compiled prompts.
pub struct BuiltinPromptStore {
    templates: HashMap<String, String>,
    cache: Mutex<LruCache<String, (String, Instant)>>,
    ttl: Duration,
}

impl BuiltinPromptStore {
    pub fn new(ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(256).expect("256 is non-zero");
        Self {
            templates: HashMap::new(),
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Register an override template for `name`.
    pub fn with_template(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.templates.insert(name.into(), template.into());
        self
    }

    fn cache_key(name: &str, vars: &HashMap<String, String>) -> String {
        let mut pairs: Vec<_> = vars.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        let mut key = String::from(name);
        for (k, v) in pairs {
            key.push('\u{1f}');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }
}

impl Default for BuiltinPromptStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl PromptStore for BuiltinPromptStore {
    fn compile(&self, name: &str, vars: &HashMap<String, String>, fallback: &str) -> String {
        let key = Self::cache_key(name, vars);
        {
            let mut cache = self.cache.lock().expect("prompt cache lock poisoned");
            let stale = match cache.get(&key) {
                Some((compiled, at)) if at.elapsed() < self.ttl => return compiled.clone(),
                Some(_) => true,
                None => false,
            };
            if stale {
                cache.pop(&key);
            }
        }

        let template = self.templates.get(name).map(String::as_str).unwrap_or(fallback);
        let compiled = render(template, vars);

        self.cache
            .lock()
            .expect("prompt cache lock poisoned")
            .put(key, (compiled.clone(), Instant::now()));
        compiled
    }
}

// ---------------------------------------------------------------------------
// Fallback templates
// ---------------------------------------------------------------------------

/// Baked-in fallback templates, keyed by prompt name. These are what runs
/// use when no registry override exists.
pub mod fallback {
    pub const ARCHITECT: &str = "\
You are the Architect, responsible for the foundational concept of a story.

Seed idea: {seed_idea}

Develop the concept into a narrative foundation with a premise, genre, tone, \
narrative arc, central themes, and an opening hook. Keep the premise to two \
or three sentences and make the hook concrete.

Output as JSON with fields: premise, genre, tone, arc, themes, hook.";

    pub const PROFILER: &str = "\
You are the Profiler, responsible for the story's cast.

Premise: {premise}
Genre: {genre}
Tone: {tone}

Create the principal characters for this story. Each needs a name, a role \
(protagonist, antagonist, or supporting), a short description, their \
psychology, background, and character arc.

Output as JSON: an array of character objects.";

    pub const NARRATOR: &str = "\
You are the Profiler, now designing the narrator for this story.

Premise: {premise}
Tone: {tone}
Characters:
{characters}

Decide the narrative voice: person, tense, distance, and any stylistic \
signature the prose should keep throughout.

Output as JSON with fields: person, tense, distance, style_notes.";

    pub const WORLDBUILDER: &str = "\
You are the Worldbuilder.

Premise: {premise}
Genre: {genre}
Characters:
{characters}

Build the world this story needs: settings, rules, institutions, and any \
technology or customs the plot depends on. Keep each element grounded in \
the premise.

Output as JSON: a mapping from element type to an element object with name \
and description.";

    pub const STRATEGIST_OUTLINE: &str = "\
You are the Strategist, responsible for the scene-by-scene outline.

Premise: {premise}
Narrative arc: {arc}
Characters:
{characters}
Key constraints:
{constraints}

Produce a complete outline. Every scene needs a sceneNumber, title, setting, \
the characters present, a target wordCount, a hook the scene must land, and \
any futureEvents it sets up but must not reveal.

Output as JSON with field: scenes.";

    pub const STRATEGIST_PLAN: &str = "\
You are the Strategist, producing the advanced plan for drafting.

Outline:
{outline}
Key constraints:
{constraints}

For the outline above, plan pacing, point-of-view notes, and continuity \
watch-items the Writer must respect scene to scene.

Output as JSON with fields: pacing, pov_notes, continuity_notes.";

    pub const WRITER_DRAFT: &str = "\
You are the Writer. Draft scene {scene_number}: {title}.

Setting: {setting}
Characters present: {scene_characters}
Scene hook: {hook}
Target length: {target_words} words.

Relevant context:
{context}

Key constraints (never contradict these):
{constraints}

Write the scene in full. Do not summarize, do not annotate, and do not \
reveal future events.";

    pub const WRITER_BEAT: &str = "\
You are the Writer, drafting scene {scene_number} in parts. This is part \
{part_index} of {parts_total}; aim for {part_target_words} words in this part.

{beat_position}

Scene so far:
{existing_content}

Setting: {setting}
Scene hook: {hook}
Key constraints (never contradict these):
{constraints}

Continue the scene from exactly where it stops. Do not repeat earlier text, \
do not summarize, and do not close the scene unless this is the final part.";

    pub const WRITER_EXPAND: &str = "\
You are the Writer, expanding scene {scene_number}.

The scene below is {additional_words} words short of its target. Continue \
it from exactly where it stops, deepening what is already on the page \
without repeating it.

Scene so far:
{existing_content}";

    pub const WRITER_REVISE: &str = "\
You are the Writer, revising scene {scene_number}: {title}.

Current draft:
{content}

The Critic requires the following changes:
{revision_requests}

Issues raised:
{issues}

Rewrite the full scene addressing every request. Keep what already works.";

    pub const WRITER_POLISH: &str = "\
You are the Writer, polishing scene {scene_number}: {title}.

Current draft:
{content}

Perform a line-level polish: tighten prose, sharpen dialogue, and fix \
rhythm. Return the complete polished scene. Do not shorten it materially, \
do not change how it ends, and never replace passages with commentary \
about what stays the same.";

    pub const CRITIC: &str = "\
You are the Critic, reviewing scene {scene_number}: {title}.

Draft ({word_count} words, target {target_words}):
{content}

Scene hook: {hook}
Future events that must NOT appear: {future_events}

Score the scene 1-10 and decide whether revision is needed. List concrete \
issues, revision requests, and strengths. Check word-count compliance and \
whether the scene stays in scope.

Output as JSON with fields: score, revision_needed, approved, issues, \
revision_requests, strengths, word_count_compliance, scope_adherence.";

    pub const MANUSCRIPT_CRITIC: &str = "\
You are the Critic, reviewing the assembled manuscript.

{summary}

Judge the manuscript as a whole: arc completeness, pacing across scenes, \
continuity, and payoff. Score it 1-10 and decide whether a revision pass \
is needed. List concrete issues and revision requests naming the scenes \
they apply to.

Output as JSON with fields: score, revision_needed, approved, issues, \
revision_requests, strengths.";

    pub const ORIGINALITY: &str = "\
You are the Originality reviewer.

Manuscript summary:
{summary}

Assess the manuscript for derivative plotting, stock characters, and \
borrowed prose rhythms. Note anything too close to a recognizable work.

Output as JSON with fields: score, findings, recommendations.";

    pub const IMPACT: &str = "\
You are the Impact assessor.

Manuscript summary:
{summary}

Assess emotional impact, thematic payoff, and ending resonance.

Output as JSON with fields: score, highlights, weak_points.";

    pub const ARCHIVIST: &str = "\
You are the Archivist, maintaining story continuity.

New facts observed since your last pass:
{facts}

Current key constraints:
{constraints}

Current world state:
{world_state}

Consolidate the new facts. Propose updated key constraints (key, value) and \
a world-state diff with additions, removals, and field sets under \
characters, locations, and flags. Also list the notable developments as \
(subject, change, category).

Output as JSON with fields: constraints, world_state_diff, developments.";

    pub const RELEVANCE_EVALUATOR: &str = "\
You are evaluating retrieval relevance.

Query: {query}
Retrieved context:
{context}

Score 0-1 how relevant the retrieved context is to the query.

Output as JSON with fields: score, rationale.";

    pub const FAITHFULNESS_EVALUATOR: &str = "\
You are evaluating faithfulness.

Constraints:
{constraints}
Scene:
{content}

Score 0-1 how faithful the scene is to the constraints, and list any \
contradictions.

Output as JSON with fields: score, contradictions.";
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn render_expands_placeholders() {
        let out = render("scene {n}: {title}", &vars(&[("n", "3"), ("title", "Storm")]));
        assert_eq!(out, "scene 3: Storm");
    }

    #[test]
    fn compile_prefers_registered_template() {
        let store = BuiltinPromptStore::default().with_template("writer_draft", "custom {x}");
        let out = store.compile("writer_draft", &vars(&[("x", "1")]), "fallback {x}");
        assert_eq!(out, "custom 1");
    }

    #[test]
    fn compile_uses_fallback_when_unregistered() {
        let store = BuiltinPromptStore::default();
        let out = store.compile("missing", &vars(&[("x", "1")]), "fallback {x}");
        assert_eq!(out, "fallback 1");
    }

    #[test]
    fn cache_expires_after_ttl() {
        let store = BuiltinPromptStore::new(Duration::from_millis(0)).with_template("p", "v1 {x}");
        let first = store.compile("p", &vars(&[("x", "a")]), "");
        assert_eq!(first, "v1 a");
        // Zero TTL: the cached entry is already stale, so compile again.
        let second = store.compile("p", &vars(&[("x", "a")]), "");
        assert_eq!(second, "v1 a");
    }

    #[test]
    fn cache_key_distinguishes_vars() {
        let store = BuiltinPromptStore::default();
        let a = store.compile("p", &vars(&[("x", "1")]), "{x}");
        let b = store.compile("p", &vars(&[("x", "2")]), "{x}");
        assert_eq!(a, "1");
        assert_eq!(b, "2");
    }

    #[test]
    fn json_agents_request_json_output() {
        for template in [
            fallback::ARCHITECT,
            fallback::PROFILER,
            fallback::WORLDBUILDER,
            fallback::STRATEGIST_OUTLINE,
            fallback::CRITIC,
            fallback::ARCHIVIST,
        ] {
            assert!(template.contains("Output as JSON"), "template lacks JSON marker");
        }
        assert!(!fallback::WRITER_DRAFT.contains("Output as JSON"));
    }
}
