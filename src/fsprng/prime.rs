//! Deterministic prime search for the secret key factors.

use std::sync::OnceLock;

use num_bigint::BigUint;
use num_traits::{One, Zero};

/// Trial-division bound; candidates divisible by any prime below it are
/// rejected before the first modular exponentiation.
const SIEVE_LIMIT: usize = 2000;

/// Miller–Rabin witnesses.  The candidates come from a hash expansion, not an
/// adversary, so a fixed base set is as good as random bases here.
const WITNESSES: [u32; 24] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89,
];

fn small_primes() -> &'static [u32] {
    static PRIMES: OnceLock<Vec<u32>> = OnceLock::new();
    PRIMES.get_or_init(|| {
        let mut composite = vec![false; SIEVE_LIMIT];
        let mut out = Vec::new();
        for i in 2..SIEVE_LIMIT {
            if composite[i] {
                continue;
            }
            out.push(i as u32);
            let mut j = i * i;
            while j < SIEVE_LIMIT {
                composite[j] = true;
                j += i;
            }
        }
        out
    })
}

pub(crate) fn is_probable_prime(n: &BigUint) -> bool {
    let one = BigUint::one();
    let two = BigUint::from(2u32);
    if n < &two {
        return false;
    }
    for &p in small_primes() {
        if *n == BigUint::from(p) {
            return true;
        }
        if (n % p).is_zero() {
            return false;
        }
    }

    let n_minus_1 = n - &one;
    let s = n_minus_1.trailing_zeros().unwrap_or(0);
    let d = &n_minus_1 >> s;

    'witness: for &a in WITNESSES.iter() {
        let a = BigUint::from(a);
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_1 {
            continue;
        }
        for _ in 1..s {
            x = (&x * &x) % n;
            if x == n_minus_1 {
                continue 'witness;
            }
            if x == one {
                return false;
            }
        }
        return false;
    }
    true
}

/// Smallest prime `p ≥ start` with `p ≡ start (mod 4)`, stepping by 4.
pub(crate) fn next_prime_step4(start: BigUint) -> BigUint {
    let mut p = start;
    let four = BigUint::from(4u32);
    while !is_probable_prime(&p) {
        p += &four;
    }
    p
}
