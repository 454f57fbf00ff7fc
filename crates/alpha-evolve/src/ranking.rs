//! Multi-objective ranking: fast non-dominated sorting with crowding
//! distance inside each front. All objectives are maximized.

/// True when `a` is at least as good everywhere and strictly better
/// somewhere.
fn dominates(a: &[f64], b: &[f64]) -> bool {
    let mut strictly_better = false;
    for (x, y) in a.iter().zip(b.iter()) {
        if x < y {
            return false;
        }
        if x > y {
            strictly_better = true;
        }
    }
    strictly_better
}

/// Groups indices into dominance fronts, best front first.
pub fn fast_non_dominated_sort(objectives: &[Vec<f64>]) -> Vec<Vec<usize>> {
    let n = objectives.len();
    let mut dominated_by: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut domination_count = vec![0usize; n];
    let mut fronts: Vec<Vec<usize>> = Vec::new();
    let mut first = Vec::new();

    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            if dominates(&objectives[i], &objectives[j]) {
                dominated_by[i].push(j);
            } else if dominates(&objectives[j], &objectives[i]) {
                domination_count[i] += 1;
            }
        }
        if domination_count[i] == 0 {
            first.push(i);
        }
    }

    fronts.push(first);
    let mut current = 0;
    while current < fronts.len() && !fronts[current].is_empty() {
        let mut next = Vec::new();
        for &i in &fronts[current] {
            for &j in &dominated_by[i] {
                domination_count[j] -= 1;
                if domination_count[j] == 0 {
                    next.push(j);
                }
            }
        }
        if next.is_empty() {
            break;
        }
        fronts.push(next);
        current += 1;
    }
    fronts
}

/// Crowding distance of each member of a front; boundary points get an
/// infinite distance so the spread of the front survives selection.
pub fn crowding_distance(front: &[usize], objectives: &[Vec<f64>]) -> Vec<f64> {
    let n = front.len();
    let mut distance = vec![0.0_f64; n];
    if n == 0 {
        return distance;
    }
    if n <= 2 {
        return vec![f64::INFINITY; n];
    }
    let n_obj = objectives[front[0]].len();

    for m in 0..n_obj {
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            objectives[front[a]][m]
                .partial_cmp(&objectives[front[b]][m])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        distance[order[0]] = f64::INFINITY;
        distance[order[n - 1]] = f64::INFINITY;
        let span = objectives[front[order[n - 1]]][m] - objectives[front[order[0]]][m];
        if span.abs() < 1e-15 {
            continue;
        }
        for k in 1..n - 1 {
            let gap = objectives[front[order[k + 1]]][m] - objectives[front[order[k - 1]]][m];
            distance[order[k]] += gap / span;
        }
    }
    distance
}

/// Full NSGA-II order: indices best-first, by front then by descending
/// crowding distance inside each front.
pub fn rank_indices(objectives: &[Vec<f64>]) -> Vec<usize> {
    let fronts = fast_non_dominated_sort(objectives);
    let mut order = Vec::with_capacity(objectives.len());
    for front in fronts {
        let distances = crowding_distance(&front, objectives);
        let mut members: Vec<(usize, f64)> =
            front.iter().copied().zip(distances.into_iter()).collect();
        members.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        order.extend(members.into_iter().map(|(i, _)| i));
    }
    order
}
