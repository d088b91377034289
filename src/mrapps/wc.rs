use crate::mr::worker::KeyValue;

/// Emits `(word, "1")` for every word in `contents`.
pub fn map(_filename: &str, contents: &str) -> Vec<KeyValue> {
    split_to_words(contents)
        .into_iter()
        .fold(vec![], |mut acc, wrd| {
            acc.push(new_kv!(wrd, "1"));
            acc
        })
}

/// The number of occurrences of the word.
pub fn reduce(_key: &str, values: &[String]) -> String {
    values.len().to_string()
}

// split_to_words treats punctuations and whitespaces as the delimiter and
// split input string into words.
fn split_to_words(line: &str) -> Vec<String> {
    let mut ret = vec![];
    let mut word = String::new();
    for c in line.chars() {
        if c.is_alphabetic() {
            word.push(c);
            continue;
        }
        if !word.is_empty() {
            ret.push(std::mem::take(&mut word));
        }
    }
    if !word.is_empty() {
        ret.push(word);
    }
    ret
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split_to_words() {
        let inp = "almost no restrictions whatsoever.  \
                   You may copy it, give it away or";
        let get = split_to_words(inp);
        let expect = vec![
            "almost",
            "no",
            "restrictions",
            "whatsoever",
            "You",
            "may",
            "copy",
            "it",
            "give",
            "it",
            "away",
            "or",
        ];
        assert_eq!(&get, &expect);
    }

    #[test]
    fn test_map_then_reduce() {
        let kvs = map("doc", "it is what it is");
        assert_eq!(kvs.len(), 5);
        assert!(kvs.iter().all(|kv| kv.value == "1"));
        let its: Vec<String> = kvs
            .into_iter()
            .filter(|kv| kv.key == "it")
            .map(|kv| kv.value)
            .collect();
        assert_eq!(reduce("it", &its), "2");
    }
}
