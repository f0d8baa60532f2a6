//! Natural-order string comparison.
//!
//! Log file names embed zero-padded and unpadded numeric components
//! (`2024-1-3-...` vs `2024-01-03-...`) that must sort the same way a
//! human would read them rather than byte-lexicographically. This splits
//! each string into runs of digits and non-digits and compares digit runs
//! by numeric value.

use std::cmp::Ordering;

fn split_runs(s: &str) -> Vec<&str> {
    let mut runs = Vec::new();
    let bytes = s.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        let is_digit = bytes[start].is_ascii_digit();
        let mut end = start + 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() == is_digit {
            end += 1;
        }
        runs.push(&s[start..end]);
        start = end;
    }
    runs
}

/// Compare two strings in natural order.
pub fn compare(a: &str, b: &str) -> Ordering {
    let a_runs = split_runs(a);
    let b_runs = split_runs(b);

    for (a_run, b_run) in a_runs.iter().zip(b_runs.iter()) {
        let ordering = match (
            a_run.as_bytes().first().map(u8::is_ascii_digit),
            b_run.as_bytes().first().map(u8::is_ascii_digit),
        ) {
            (Some(true), Some(true)) => {
                let a_num = a_run.trim_start_matches('0');
                let b_num = b_run.trim_start_matches('0');
                a_num
                    .len()
                    .cmp(&b_num.len())
                    .then_with(|| a_num.cmp(b_num))
                    .then_with(|| a_run.len().cmp(&b_run.len()))
            }
            _ => a_run.cmp(b_run),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    a_runs.len().cmp(&b_runs.len())
}

/// Sort `items` in place by natural order of the string each maps to via `key`.
pub fn sort_by_key<T>(items: &mut [T], mut key: impl FnMut(&T) -> String) {
    let keyed: Vec<String> = items.iter().map(|item| key(item)).collect();
    let mut indices: Vec<usize> = (0..items.len()).collect();
    indices.sort_by(|&a, &b| compare(&keyed[a], &keyed[b]));

    // Apply the permutation in place.
    let mut visited = vec![false; items.len()];
    for i in 0..items.len() {
        if visited[i] {
            continue;
        }
        let mut cur = i;
        loop {
            visited[cur] = true;
            let next = indices[cur];
            if next == i {
                break;
            }
            items.swap(cur, next);
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_numeric_runs_by_value() {
        assert_eq!(compare("file-2.log", "file-10.log"), Ordering::Less);
        assert_eq!(compare("file-10.log", "file-2.log"), Ordering::Greater);
    }

    #[test]
    fn falls_back_to_byte_order_for_non_numeric_runs() {
        assert_eq!(compare("abc", "abd"), Ordering::Less);
    }

    #[test]
    fn treats_equal_numeric_value_with_different_padding_as_equal_then_shorter_first() {
        assert_eq!(compare("v01", "v1"), Ordering::Less);
    }

    #[test]
    fn sorts_a_vec_of_log_names_naturally() {
        let mut names = vec![
            "2024-1-10.log".to_string(),
            "2024-1-2.log".to_string(),
            "2024-1-1.log".to_string(),
        ];
        sort_by_key(&mut names, |s| s.clone());
        assert_eq!(
            names,
            vec!["2024-1-1.log", "2024-1-2.log", "2024-1-10.log"]
        );
    }
}
