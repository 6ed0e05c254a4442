//! Public session identities
//!
//! Identities double as subdomains, so they are restricted to lowercase DNS
//! label characters. Generated identities read like `brave-otter-42`.

use rand::seq::SliceRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "afraid", "ancient", "angry", "average", "bad", "big", "bitter", "black", "blue", "brave",
    "breezy", "bright", "brown", "calm", "chatty", "chilly", "clever", "cold", "cool", "cowardly",
    "crazy", "curly", "cute", "dangerous", "dark", "dry", "dull", "eager", "early", "easy",
    "eleven", "empty", "evil", "fair", "famous", "fast", "fat", "fluffy", "fresh", "friendly",
    "funny", "fuzzy", "gentle", "giant", "good", "great", "green", "grumpy", "happy", "heavy",
    "hot", "huge", "humble", "itchy", "jolly", "kind", "large", "lazy", "light", "little",
    "loud", "lucky", "mean", "mighty", "modern", "moody", "nasty", "neat", "nervous", "new",
    "nice", "odd", "old", "orange", "ordinary", "perfect", "pink", "plastic", "polite", "popular",
    "pretty", "proud", "purple", "quick", "quiet", "rare", "red", "rich", "rotten", "rude",
    "selfish", "serious", "shaggy", "sharp", "short", "shy", "silent", "silly", "slimy", "slow",
    "small", "smart", "smooth", "soft", "sour", "spicy", "splendid", "spotty", "stale", "strange",
    "strong", "stupid", "sweet", "swift", "tall", "tame", "tasty", "tender", "terrible", "thin",
    "tidy", "tiny", "tough", "tricky", "ugly", "unlucky", "warm", "weak", "wet", "white",
    "wicked", "wise", "witty", "wonderful", "yellow", "young",
];

const ANIMALS: &[&str] = &[
    "ape", "baboon", "badger", "bat", "bear", "bird", "bobcat", "bulldog", "bullfrog", "cat",
    "catfish", "cheetah", "chicken", "chipmunk", "cobra", "cougar", "cow", "crab", "deer", "dingo",
    "dodo", "dog", "dolphin", "donkey", "dragon", "dragonfly", "duck", "eagle", "earwig", "eel",
    "elephant", "emu", "falcon", "fireant", "firefox", "fish", "fly", "fox", "frog", "gecko",
    "goat", "goose", "grasshopper", "horse", "hound", "husky", "impala", "insect", "jellyfish",
    "kangaroo", "ladybug", "liger", "lion", "lionfish", "lizard", "mayfly", "mole", "monkey",
    "moose", "moth", "mouse", "mule", "newt", "octopus", "otter", "owl", "panda", "panther",
    "parrot", "penguin", "pig", "puma", "pug", "quail", "rabbit", "rat", "rattlesnake", "robin",
    "seahorse", "sheep", "shrimp", "skunk", "sloth", "snail", "snake", "squid", "starfish",
    "stingray", "swan", "termite", "tiger", "treefrog", "turkey", "turtle", "vampirebat",
    "walrus", "warthog", "wasp", "wolverine", "wombat", "yak", "zebra",
];

/// Generate a random human-readable identity
pub fn random_id() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("otter");
    let number: u8 = rng.gen_range(0..100);
    format!("{}-{}-{}", adjective, animal, number)
}

/// Check whether an identity requested by a client is acceptable
///
/// Either 4-63 lowercase alphanumerics, or 6-65 characters of lowercase
/// alphanumerics and hyphens that start and end with an alphanumeric.
pub fn is_valid_id(id: &str) -> bool {
    let is_alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let bytes = id.as_bytes();

    if (4..=63).contains(&bytes.len()) && bytes.iter().all(is_alnum) {
        return true;
    }

    if !(6..=65).contains(&bytes.len()) {
        return false;
    }

    let (first, rest) = match bytes.split_first() {
        Some(split) => split,
        None => return false,
    };
    let (last, middle) = match rest.split_last() {
        Some(split) => split,
        None => return false,
    };

    is_alnum(first) && is_alnum(last) && middle.iter().all(|b| is_alnum(b) || *b == b'-')
}
