//! Collapses aliased members of a freshly fetched group.

use std::collections::HashMap;

use tracing::debug;

use crate::identity::IdentityGraph;
use crate::names::{names_match, normalize_name};
use crate::schemas::{Member, MemberId, Session, SpendingGroup};

#[derive(Clone, Debug)]
pub struct NormalizedGroup {
    pub group: SpendingGroup,
    /// Every alias discovered while normalizing, for rewriting the group's expenses.
    pub aliases: IdentityGraph,
}

/// Exact id match, or a name that token-matches the signed-in user's name.
pub fn looks_like_current_user(member: &Member, session: &Session) -> bool {
    member.id == session.member_id || names_match(&member.name, &session.name)
}

/// Normalize one group.
///
/// `declared` carries equivalences declared by the remote friend store; only
/// pairs where both ids are members of this group are applied.
pub fn normalize_group(
    group: &SpendingGroup,
    session: &Session,
    declared: &IdentityGraph,
) -> NormalizedGroup {
    let mut graph = IdentityGraph::new();
    graph.pin(session.member_id);
    for member in &group.members {
        graph.insert(member.id);
    }

    for (index, first) in group.members.iter().enumerate() {
        for second in group.members.iter().skip(index + 1) {
            if first.id != second.id && declared.are_same_person(first.id, second.id) {
                graph.union(first.id, second.id);
            }
        }
    }

    for member in &group.members {
        if looks_like_current_user(member, session) {
            graph.union(session.member_id, member.id);
        }
    }

    let mut first_by_name: HashMap<String, MemberId> = HashMap::new();
    for member in &group.members {
        if graph.are_same_person(member.id, session.member_id) {
            continue;
        }
        let key = normalize_name(&member.name);
        if key.is_empty() {
            continue;
        }
        match first_by_name.get(&key) {
            Some(&first) => {
                graph.union(first, member.id);
            }
            None => {
                first_by_name.insert(key, member.id);
            }
        }
    }

    let mut members: Vec<Member> = Vec::with_capacity(group.members.len());
    for member in &group.members {
        let canonical = graph.canonical(member.id);
        if members.iter().any(|kept| kept.id == canonical) {
            continue;
        }
        let name = if canonical == session.member_id {
            session.name.clone()
        } else {
            group
                .member(canonical)
                .map_or_else(|| member.name.clone(), |owner| owner.name.clone())
        };
        members.push(Member::new(canonical, name));
    }

    if members.len() != group.members.len() {
        debug!(
            group_id = %group.id,
            before = group.members.len(),
            after = members.len(),
            "collapsed aliased group members"
        );
    }

    let is_direct = members.len() == 2;
    NormalizedGroup {
        group: SpendingGroup {
            id: group.id,
            name: group.name.clone(),
            members,
            created_at: group.created_at,
            is_direct: Some(is_direct),
        },
        aliases: graph,
    }
}
