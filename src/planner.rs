use crate::error::Cancelled;
use crate::prompt::Prompter;
use colored::*;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::io::{BufRead, Write};

/// One place in a parsed control file that can carry a payload reference.
/// Recomputed on every run, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionPoint<H> {
    pub label: String,
    pub target: H,
    pub is_wildcard: bool,
}

/// Every injection point of one control file, in document order.
#[derive(Debug, Clone)]
pub struct Plan<H> {
    pub points: Vec<InjectionPoint<H>>,
    wildcard: Option<usize>,
}

impl<H> Plan<H> {
    /// The first wildcard group is the one offered for "inject everywhere".
    pub fn new(points: Vec<InjectionPoint<H>>) -> Self {
        let wildcard = points.iter().position(|p| p.is_wildcard);
        Plan { points, wildcard }
    }

    /// Pick a different wildcard group than the first one, if `prefer` matches one.
    pub fn prefer_wildcard(mut self, prefer: impl Fn(&H) -> bool) -> Self {
        if let Some(idx) = self.points.iter().position(|p| p.is_wildcard && prefer(&p.target)) {
            self.wildcard = Some(idx);
        }
        self
    }

    pub fn wildcard(&self) -> Option<usize> {
        self.wildcard
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn labels(&self) -> Vec<String> {
        self.points.iter().map(|p| p.label.clone()).collect()
    }
}

/// What the operator decided to do with a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Wildcard(usize),
    SynthesizeWildcard,
    Points(Vec<usize>),
}

/// A tree-shaped control file (Ansible plays, Salt top file) that the
/// planner can enumerate and the mutator can append references to.
pub trait TreeModel {
    type Handle: Clone;

    fn plan(&self) -> Plan<Self::Handle>;

    /// Append `payload` to the group behind `handle`. Returns `false` when
    /// the group already references it.
    fn inject(&mut self, handle: &Self::Handle, payload: &str) -> bool;

    /// Add a new catch-all group holding only `payload`. Returns `false`
    /// when the model has nowhere to put one.
    fn add_wildcard_group(&mut self, payload: &str) -> bool;

    fn to_yaml(&self) -> Result<String, serde_yaml::Error>;
}

/// Turn operator answers into a selection.
///
/// Unless `specific` is set, a wildcard group is offered first; without one
/// the operator may have one synthesized. Declining falls through to picking
/// individual groups by index.
pub fn resolve<H, R: BufRead, W: Write>(
    plan: &Plan<H>,
    prompter: &mut Prompter<R, W>,
    specific: bool,
) -> Result<Selection, Cancelled> {
    if !specific {
        match plan.wildcard() {
            Some(idx) => {
                let question = format!(
                    "Found a group targeting every managed host ({}). Inject into it?",
                    plan.points[idx].label
                );
                if prompter.ask(&question)? {
                    return Ok(Selection::Wildcard(idx));
                }
            }
            None => {
                if prompter.ask("No group targets every managed host. Add one that runs the payload everywhere?")? {
                    return Ok(Selection::SynthesizeWildcard);
                }
            }
        }
    }

    if plan.is_empty() {
        info!("No host groups to choose from");
        return Ok(Selection::Points(Vec::new()));
    }

    let labels = plan.labels();
    let print_options = |out: &mut dyn Write| -> std::io::Result<()> {
        for (i, label) in labels.iter().enumerate() {
            writeln!(out, "  [{}] {label}", i.to_string().yellow())?;
        }
        Ok(())
    };

    prompter.say(&"Available host groups:".bold().to_string());
    for (i, label) in labels.iter().enumerate() {
        prompter.say(&format!("  [{}] {label}", i.to_string().yellow()));
    }
    let valid: BTreeSet<usize> = (0..labels.len()).collect();
    let chosen = prompter.ask_indices(
        "Enter the groups to inject into, separated by commas (q to quit):",
        &valid,
        Some(&print_options),
    )?;
    Ok(Selection::Points(chosen))
}

/// Apply a selection to the model. Returns how many references were added.
pub fn apply<M: TreeModel>(model: &mut M, plan: &Plan<M::Handle>, selection: &Selection, payload: &str) -> usize {
    let indices: &[usize] = match selection {
        Selection::SynthesizeWildcard => {
            let added = model.add_wildcard_group(payload);
            if !added {
                warn!("Unable to add a catch-all group for {payload}");
            }
            return usize::from(added);
        }
        Selection::Wildcard(idx) => std::slice::from_ref(idx),
        Selection::Points(indices) => indices,
    };

    let mut added = 0;
    for &idx in indices {
        let point = &plan.points[idx];
        if model.inject(&point.target, payload) {
            debug!("Added {payload} to {}", point.label);
            added += 1;
        } else {
            info!("{} already references {payload}, skipping", point.label);
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Minimal model: named groups holding lists of references.
    #[derive(Debug, Clone, PartialEq)]
    struct Groups(Vec<(String, Vec<String>)>);

    impl TreeModel for Groups {
        type Handle = usize;

        fn plan(&self) -> Plan<usize> {
            Plan::new(
                self.0
                    .iter()
                    .enumerate()
                    .map(|(i, (name, _))| InjectionPoint {
                        label: format!("Hosts: {name}"),
                        target: i,
                        is_wildcard: name == "*",
                    })
                    .collect(),
            )
        }

        fn inject(&mut self, handle: &usize, payload: &str) -> bool {
            let refs = &mut self.0[*handle].1;
            if refs.iter().any(|r| r == payload) {
                return false;
            }
            refs.push(payload.to_string());
            true
        }

        fn add_wildcard_group(&mut self, payload: &str) -> bool {
            self.0.push(("*".to_string(), vec![payload.to_string()]));
            true
        }

        fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
            serde_yaml::to_string(&self.0)
        }
    }

    fn prompter(input: &str) -> Prompter<Cursor<Vec<u8>>, Vec<u8>> {
        colored::control::set_override(false);
        Prompter::new(Cursor::new(input.as_bytes().to_vec()), Vec::new())
    }

    fn groups(names: &[&str]) -> Groups {
        Groups(names.iter().map(|n| (n.to_string(), vec!["base".to_string()])).collect())
    }

    #[test]
    fn test_wildcard_fast_path() {
        let model = groups(&["web", "*", "db"]);
        let plan = model.plan();
        assert_eq!(plan.wildcard(), Some(1));
        assert_eq!(resolve(&plan, &mut prompter("Y\n"), false), Ok(Selection::Wildcard(1)));
    }

    #[test]
    fn test_declined_wildcard_falls_through_to_indices() {
        let model = groups(&["web", "*"]);
        let mut p = prompter("n\n0\n");
        assert_eq!(resolve(&model.plan(), &mut p, false), Ok(Selection::Points(vec![0])));
        let out = String::from_utf8(p.into_output()).unwrap();
        assert!(out.contains("[0] Hosts: web"));
        assert!(out.contains("[1] Hosts: *"));
    }

    #[test]
    fn test_specific_skips_wildcard_question() {
        let model = groups(&["web", "*"]);
        let mut p = prompter("1,0\n");
        assert_eq!(resolve(&model.plan(), &mut p, true), Ok(Selection::Points(vec![0, 1])));
        let out = String::from_utf8(p.into_output()).unwrap();
        assert!(!out.contains("[Y/n/q]"));
    }

    #[test]
    fn test_invalid_indices_reprint_options() {
        let model = groups(&["web", "db"]);
        let mut p = prompter("n\n5\n1\n");
        assert_eq!(resolve(&model.plan(), &mut p, false), Ok(Selection::Points(vec![1])));
        let out = String::from_utf8(p.into_output()).unwrap();
        assert_eq!(out.matches("[1] Hosts: db").count(), 2);
    }

    #[test]
    fn test_quit_during_selection() {
        let model = groups(&["web"]);
        assert_eq!(resolve(&model.plan(), &mut prompter("n\nq\n"), false), Err(Cancelled));
        assert_eq!(resolve(&model.plan(), &mut prompter("q\n"), false), Err(Cancelled));
    }

    #[test]
    fn test_prefer_wildcard() {
        let model = groups(&["*", "db", "*"]);
        let plan = model.plan().prefer_wildcard(|h| *h == 2);
        assert_eq!(plan.wildcard(), Some(2));
        let plan = model.plan().prefer_wildcard(|h| *h == 1);
        assert_eq!(plan.wildcard(), Some(0));
    }

    #[test]
    fn test_apply_wildcard_adds_exactly_one_reference() {
        let mut model = groups(&["web", "*", "db"]);
        let before = model.clone();
        let plan = model.plan();
        assert_eq!(apply(&mut model, &plan, &Selection::Wildcard(1), "my_cmd"), 1);
        assert_eq!(model.0[1].1, vec!["base", "my_cmd"]);
        assert_eq!(model.0[0], before.0[0]);
        assert_eq!(model.0[2], before.0[2]);

        // second run is a no-op
        assert_eq!(apply(&mut model, &plan, &Selection::Wildcard(1), "my_cmd"), 0);
        assert_eq!(model.0[1].1, vec!["base", "my_cmd"]);
    }

    #[test]
    fn test_apply_synthesize_adds_one_group() {
        let mut model = groups(&["web"]);
        let plan = model.plan();
        assert_eq!(apply(&mut model, &plan, &Selection::SynthesizeWildcard, "my_cmd"), 1);
        assert_eq!(model.0.len(), 2);
        assert_eq!(model.0[1], ("*".to_string(), vec!["my_cmd".to_string()]));
        assert_eq!(model.0[0].1, vec!["base"]);
    }

    #[test]
    fn test_empty_plan_offers_only_synthesis() {
        let model = Groups(Vec::new());
        assert_eq!(resolve(&model.plan(), &mut prompter("n\n"), false), Ok(Selection::Points(vec![])));
        assert_eq!(resolve(&model.plan(), &mut prompter("Y\n"), false), Ok(Selection::SynthesizeWildcard));
    }
}
