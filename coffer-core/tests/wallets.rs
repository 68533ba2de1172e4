//! Wallet lifecycle: creation, reopen, watch-only forks, seed custody,
//! private-chain extension, passphrase slots, and the account shapes.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use coffer_core::address::AddressType;
use coffer_core::assets::derivation::{armory135, Bip32Node, HARDENED};
use coffer_core::assets::AccountKind;
use coffer_core::buffer::SecureBytes;
use coffer_core::container::PassphraseProvider;
use coffer_core::crypto::ecc;
use coffer_core::crypto::hashes::hash160;
use coffer_core::error::{AssetError, ContainerError, WalletError};
use coffer_core::wallet::{AccountTypeBip32, AccountTypeEcdh, AssetWallet, WalletManager};

use common::{provider, search_file, test_kdf};

fn control() -> PassphraseProvider {
    provider(b"control")
}

#[test]
fn create_close_open_preserves_address_sets() {
    let dir = tempfile::tempdir().unwrap();
    let mut expected = std::collections::BTreeMap::new();

    for _ in 0..3 {
        let root = SecureBytes::random(32);
        let wallet = AssetWallet::create_from_private_root_armory135(
            dir.path(),
            root,
            SecureBytes::from_slice(b"passphrase"),
            SecureBytes::from_slice(b"control"),
            4,
            Some(test_kdf()),
        )
        .unwrap();
        expected.insert(wallet.id().to_string(), wallet.get_addr_hash_set());
    }

    let manager = WalletManager::new(dir.path(), &control()).unwrap();
    assert_eq!(manager.get_map().len(), 3);
    for (id, hashes) in &expected {
        let container = manager.get_map().get(id).expect("wallet loaded");
        assert_eq!(&container.wallet_ptr().get_addr_hash_set(), hashes);
    }
}

#[test]
fn watch_only_copies_match_the_full_wallet() {
    let dir = tempfile::tempdir().unwrap();
    let root = SecureBytes::random(32);
    let wallet = AssetWallet::create_from_private_root_armory135(
        dir.path(),
        root.clone(),
        SecureBytes::from_slice(b"passphrase"),
        SecureBytes::from_slice(b"control"),
        4,
        Some(test_kdf()),
    )
    .unwrap();
    let filename = wallet.db_filename().to_path_buf();
    let hash_set = wallet.get_addr_hash_set();

    // Rebuild from the public root in a second directory.
    let (root_pub, chaincode) = {
        let account = wallet
            .get_account_for_id(wallet.main_account_id().unwrap())
            .unwrap();
        match account.kind {
            AccountKind::Armory135 { root, chaincode } => (root.pub_key, chaincode),
            other => panic!("unexpected account kind: {other:?}"),
        }
    };
    drop(wallet);

    let wo_dir = tempfile::tempdir().unwrap();
    let wo_wallet = AssetWallet::create_from_public_root_armory135(
        wo_dir.path(),
        &root_pub,
        chaincode,
        SecureBytes::from_slice(b"control"),
        4,
        Some(test_kdf()),
    )
    .unwrap();
    assert_eq!(wo_wallet.get_addr_hash_set(), hash_set);
    assert!(wo_wallet.is_watch_only());

    // Fork from the full wallet file.
    let fork_path = AssetWallet::fork_watching_only(&filename, &control()).unwrap();
    let fork = AssetWallet::load_main_wallet_from_file(&fork_path, &control()).unwrap();
    assert_eq!(fork.get_addr_hash_set(), hash_set);
    assert!(fork.is_watch_only());

    // Private extension on the fork is refused.
    let _guard = fork.lock_decrypted_container();
    let main = fork.main_account_id().unwrap();
    assert!(matches!(
        fork.extend_private_chain(main),
        Err(WalletError::Asset(AssetError::WatchOnly))
    ));
}

#[test]
fn seed_custody_rules() {
    let dir = tempfile::tempdir().unwrap();
    let seed = SecureBytes::random(32);
    let der_path = [HARDENED | 0x50, HARDENED | 0x5421, HARDENED | 0x24, 785];

    let wallet = AssetWallet::create_from_seed_bip32(
        dir.path(),
        &seed,
        &der_path,
        SecureBytes::from_slice(b"password"),
        SecureBytes::from_slice(b"control"),
        10,
        Some(test_kdf()),
    )
    .unwrap();
    let filename = wallet.db_filename().to_path_buf();

    // The raw seed is nowhere in the file.
    assert!(!search_file(&filename, &seed));

    let seed_obj = wallet.encrypted_seed().expect("seed stored");

    // No prompt installed: the unlock loop gives up.
    {
        let _guard = wallet.lock_decrypted_container();
        match wallet.get_decrypted_value(&seed_obj) {
            Err(WalletError::Container(ContainerError::EmptyPassphrase)) => {}
            other => panic!("expected EmptyPassphrase, got {other:?}"),
        }
    }

    // Prompt installed but no lock held.
    wallet.set_passphrase_prompt(provider(b"password"));
    match wallet.get_decrypted_value(&seed_obj) {
        Err(WalletError::Container(ContainerError::NotLocked)) => {}
        other => panic!("expected NotLocked, got {other:?}"),
    }

    // Locked and prompted: the seed comes back.
    {
        let _guard = wallet.lock_decrypted_container();
        assert_eq!(wallet.get_decrypted_value(&seed_obj).unwrap(), seed);
    }

    // Reset prompt: give-up again.
    wallet.reset_passphrase_prompt();
    {
        let _guard = wallet.lock_decrypted_container();
        assert!(wallet.get_decrypted_value(&seed_obj).is_err());
    }
    drop(wallet);

    // The watch-only fork carries no seed.
    let fork_path = AssetWallet::fork_watching_only(&filename, &control()).unwrap();
    let fork = AssetWallet::load_main_wallet_from_file(&fork_path, &control()).unwrap();
    assert!(fork.encrypted_seed().is_none());

    // The original reloads and still decrypts.
    let reloaded = AssetWallet::load_main_wallet_from_file(&filename, &control()).unwrap();
    reloaded.set_passphrase_prompt(provider(b"password"));
    let _guard = reloaded.lock_decrypted_container();
    let seed_obj = reloaded.encrypted_seed().unwrap();
    assert_eq!(reloaded.get_decrypted_value(&seed_obj).unwrap(), seed);
}

#[test]
fn lock_and_extend_derives_matching_private_keys() {
    let dir = tempfile::tempdir().unwrap();
    let seed = SecureBytes::random(32);
    let der_path = [HARDENED | 7, 3];

    let wallet = AssetWallet::create_from_seed_bip32(
        dir.path(),
        &seed,
        &der_path,
        SecureBytes::from_slice(b"password"),
        SecureBytes::from_slice(b"control"),
        5,
        Some(test_kdf()),
    )
    .unwrap();
    let main = wallet.main_account_id().unwrap();

    wallet.extend_public_chain(main, 10).unwrap();
    wallet.set_passphrase_prompt(provider(b"password"));
    {
        let _guard = wallet.lock_decrypted_container();
        wallet.extend_private_chain(main).unwrap();

        for index in [0u32, 7, 14] {
            let asset = wallet.get_main_account_asset_for_index(index).unwrap();
            let enc = asset.priv_key.clone().expect("private chain extended");
            let decrypted = wallet.get_decrypted_value(&enc).unwrap();

            let mut node = Bip32Node::init_from_seed(&seed).unwrap();
            for step in der_path {
                node.derive_private(step).unwrap();
            }
            node.derive_private(index).unwrap();
            assert_eq!(&decrypted, node.private_key().unwrap());
        }
    }
}

#[test]
fn passphrase_slot_laws() {
    let dir = tempfile::tempdir().unwrap();
    let seed = SecureBytes::random(32);
    let wallet = AssetWallet::create_from_seed_bip32_blank(
        dir.path(),
        &seed,
        SecureBytes::from_slice(b"pass one"),
        SecureBytes::from_slice(b"control"),
        Some(test_kdf()),
    )
    .unwrap();
    let filename = wallet.db_filename().to_path_buf();

    let decrypt_with = |wallet: &AssetWallet, pass: &[u8]| -> Result<SecureBytes, WalletError> {
        // Give up after the first failed attempt so wrong passes terminate.
        let attempts = Arc::new(AtomicUsize::new(0));
        let pass = pass.to_vec();
        let attempts_inner = Arc::clone(&attempts);
        wallet.set_passphrase_prompt(Arc::new(move |_| {
            if attempts_inner.fetch_add(1, Ordering::SeqCst) == 0 {
                SecureBytes::from_slice(&pass)
            } else {
                SecureBytes::default()
            }
        }));
        let _guard = wallet.lock_decrypted_container();
        let result = wallet.get_decrypted_value(&wallet.encrypted_seed().unwrap());
        wallet.reset_passphrase_prompt();
        result
    };

    // Adding a second slot makes both passphrases equivalent.
    wallet.set_passphrase_prompt(provider(b"pass one"));
    wallet
        .add_passphrase(&SecureBytes::from_slice(b"pass two"))
        .unwrap();
    assert_eq!(decrypt_with(&wallet, b"pass one").unwrap(), seed);
    assert_eq!(decrypt_with(&wallet, b"pass two").unwrap(), seed);

    // Duplicate slots are rejected.
    wallet.set_passphrase_prompt(provider(b"pass one"));
    match wallet.add_passphrase(&SecureBytes::from_slice(b"pass two")) {
        Err(WalletError::Container(ContainerError::DuplicateCipher)) => {}
        other => panic!("expected DuplicateCipher, got {other:?}"),
    }

    // Erasing the active slot keeps exactly the other one.
    wallet.set_passphrase_prompt(provider(b"pass one"));
    wallet.erase_passphrase().unwrap();
    assert!(decrypt_with(&wallet, b"pass one").is_err());
    assert_eq!(decrypt_with(&wallet, b"pass two").unwrap(), seed);

    // Changing the remaining slot rotates it in place.
    wallet.set_passphrase_prompt(provider(b"pass two"));
    wallet
        .change_passphrase(&SecureBytes::from_slice(b"pass three"))
        .unwrap();
    assert!(decrypt_with(&wallet, b"pass two").is_err());
    assert_eq!(decrypt_with(&wallet, b"pass three").unwrap(), seed);

    // The rewritten slots survive a reload.
    drop(wallet);
    let reloaded = AssetWallet::load_main_wallet_from_file(&filename, &control()).unwrap();
    assert_eq!(decrypt_with(&reloaded, b"pass three").unwrap(), seed);
    assert!(decrypt_with(&reloaded, b"pass two").is_err());
}

#[test]
fn change_passphrase_from_unencrypted_wallet() {
    let dir = tempfile::tempdir().unwrap();
    let seed = SecureBytes::random(32);
    let wallet = AssetWallet::create_from_seed_bip32_blank(
        dir.path(),
        &seed,
        SecureBytes::default(),
        SecureBytes::from_slice(b"control"),
        Some(test_kdf()),
    )
    .unwrap();
    let seed_obj = wallet.encrypted_seed().unwrap();

    // Unencrypted: decrypts with no prompt at all.
    {
        let _guard = wallet.lock_decrypted_container();
        assert_eq!(wallet.get_decrypted_value(&seed_obj).unwrap(), seed);
    }

    // Encrypting cannot go through add_passphrase.
    match wallet.add_passphrase(&SecureBytes::from_slice(b"new pass")) {
        Err(WalletError::Container(ContainerError::CannotAddToUnencrypted)) => {}
        other => panic!("expected CannotAddToUnencrypted, got {other:?}"),
    }

    // change_passphrase converts the default slot to a passphrase slot.
    wallet
        .change_passphrase(&SecureBytes::from_slice(b"new pass"))
        .unwrap();
    {
        let _guard = wallet.lock_decrypted_container();
        assert!(wallet.get_decrypted_value(&seed_obj).is_err());
    }
    wallet.set_passphrase_prompt(provider(b"new pass"));
    {
        let _guard = wallet.lock_decrypted_container();
        assert_eq!(wallet.get_decrypted_value(&seed_obj).unwrap(), seed);
    }
}

#[test]
fn salted_accounts_match_local_derivation_across_reload() {
    let dir = tempfile::tempdir().unwrap();
    let seed = SecureBytes::random(32);
    let salt1 = SecureBytes::random(32);
    let salt2 = SecureBytes::random(32);
    let path1 = vec![HARDENED | 0x50, HARDENED | 0x5de, HARDENED | 0x465a, 501];
    let path2 = vec![HARDENED | 0x50, HARDENED | 0x5de, HARDENED | 0xee4f, 327];

    let check_window = |account_path: &[u32], salt: &SecureBytes, index: u32, preimage: &[u8]| {
        let mut node = Bip32Node::init_from_seed(&seed).unwrap();
        for step in account_path {
            node.derive_private(*step).unwrap();
        }
        node.derive_private(index).unwrap();
        let salted = ecc::pubkey_scalar_multiply(node.public_key(), salt).unwrap();
        assert_eq!(preimage, salted.as_slice());
    };

    let filename;
    let acc1;
    let acc2;
    let hash_set;
    {
        let wallet = AssetWallet::create_from_seed_bip32_blank(
            dir.path(),
            &seed,
            SecureBytes::from_slice(b"password"),
            SecureBytes::from_slice(b"control"),
            Some(test_kdf()),
        )
        .unwrap();
        filename = wallet.db_filename().to_path_buf();
        wallet.set_passphrase_prompt(provider(b"password"));

        let spec = |path: &Vec<u32>, salt: &SecureBytes, main: bool| AccountTypeBip32 {
            derivation_path: path.clone(),
            salt: Some(salt.clone()),
            lookup: 40,
            address_types: BTreeSet::from([AddressType::P2wpkh]),
            default_type: AddressType::P2wpkh,
            main,
        };
        acc1 = wallet.create_bip32_account(&spec(&path1, &salt1, true)).unwrap();
        acc2 = wallet.create_bip32_account(&spec(&path2, &salt2, false)).unwrap();

        for i in 0..10u32 {
            let e1 = wallet.get_new_address_for_account(acc1, None).unwrap();
            let e2 = wallet.get_new_address_for_account(acc2, None).unwrap();
            check_window(&path1, &salt1, i, &e1.preimage());
            check_window(&path2, &salt2, i, &e2.preimage());
        }

        hash_set = wallet.get_addr_hash_set();
        assert_eq!(hash_set.len(), 80);
    }

    // Reload: same window, issuance continues at index 10.
    let wallet = AssetWallet::load_main_wallet_from_file(&filename, &control()).unwrap();
    assert_eq!(wallet.get_addr_hash_set(), hash_set);

    for i in 10..20u32 {
        let e1 = wallet.get_new_address_for_account(acc1, None).unwrap();
        let e2 = wallet.get_new_address_for_account(acc2, None).unwrap();
        check_window(&path1, &salt1, i, &e1.preimage());
        check_window(&path2, &salt2, i, &e2.preimage());
    }
}

#[test]
fn ecdh_accounts_issue_one_address_per_salt() {
    let dir = tempfile::tempdir().unwrap();
    let seed = SecureBytes::random(32);

    let priv_key = SecureBytes::from_slice(
        &hex::decode("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f")
            .unwrap(),
    );
    let pub_key = ecc::compute_public_key(&priv_key, true).unwrap();

    let filename;
    let account_id;
    let mut salts = Vec::new();
    let mut hashes = Vec::new();
    {
        let wallet = AssetWallet::create_from_seed_bip32_blank(
            dir.path(),
            &seed,
            SecureBytes::from_slice(b"password"),
            SecureBytes::from_slice(b"control"),
            Some(test_kdf()),
        )
        .unwrap();
        filename = wallet.db_filename().to_path_buf();
        wallet.set_passphrase_prompt(provider(b"password"));

        account_id = wallet
            .create_ecdh_account(&AccountTypeEcdh {
                priv_key: priv_key.clone(),
                pub_key: pub_key.clone(),
                address_types: BTreeSet::from([AddressType::P2wpkh]),
                default_type: AddressType::P2wpkh,
                main: true,
            })
            .unwrap();

        for i in 0..5u32 {
            let salt = SecureBytes::random(32);
            assert_eq!(wallet.add_ecdh_salt(account_id, salt.clone()).unwrap(), i);
            salts.push(salt);
        }
        // Idempotent re-add.
        assert_eq!(wallet.add_ecdh_salt(account_id, salts[2].clone()).unwrap(), 2);

        for salt in &salts {
            let entry = wallet.get_new_address_for_account(account_id, None).unwrap();
            let expected = ecc::pubkey_scalar_multiply(&pub_key, salt).unwrap();
            assert_eq!(entry.preimage(), expected);
            hashes.push(entry.hash());
        }

        // No sixth salt, no sixth address.
        assert!(wallet
            .get_new_address_for_account(account_id, None)
            .is_err());
    }

    // Reload and confirm the full address surface.
    let wallet = AssetWallet::load_main_wallet_from_file(&filename, &control()).unwrap();
    let hash_set = wallet.get_addr_hash_set();
    assert_eq!(hash_set.len(), 5);
    for (salt, hash) in salts.iter().zip(&hashes) {
        let expected = ecc::pubkey_scalar_multiply(&pub_key, salt).unwrap();
        assert_eq!(hash, &hash160(&expected).to_vec());
        let mut prefixed = vec![0x90u8];
        prefixed.extend_from_slice(hash);
        assert!(hash_set.contains(&prefixed));
    }
}

#[test]
fn wrong_control_passphrase_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let root = SecureBytes::random(32);
    let wallet = AssetWallet::create_from_private_root_armory135(
        dir.path(),
        root,
        SecureBytes::from_slice(b"pass"),
        SecureBytes::from_slice(b"control"),
        4,
        Some(test_kdf()),
    )
    .unwrap();
    let filename = wallet.db_filename().to_path_buf();
    drop(wallet);

    let give_up: PassphraseProvider = Arc::new(|_| SecureBytes::default());
    match AssetWallet::load_main_wallet_from_file(&filename, &give_up) {
        Err(WalletError::Container(ContainerError::EmptyPassphrase)) => {}
        other => panic!("expected EmptyPassphrase, got {other:?}"),
    }

    AssetWallet::load_main_wallet_from_file(&filename, &control()).unwrap();
}

#[test]
fn private_keys_and_public_keys_stay_off_disk() {
    let dir = tempfile::tempdir().unwrap();
    let root = SecureBytes::random(32);
    let chaincode = armory135::compute_chaincode(&root);

    let wallet = AssetWallet::create_from_private_root_armory135(
        dir.path(),
        root.clone(),
        SecureBytes::from_slice(b"passphrase"),
        SecureBytes::from_slice(b"control"),
        4,
        Some(test_kdf()),
    )
    .unwrap();
    let filename = wallet.db_filename().to_path_buf();
    drop(wallet);

    let mut priv_keys = Vec::new();
    let mut current = root.clone();
    for _ in 0..4 {
        current = armory135::chained_private_key(&current, &chaincode).unwrap();
        priv_keys.push(current.clone());
    }

    assert!(!search_file(&filename, &root));
    for priv_key in &priv_keys {
        assert!(!search_file(&filename, priv_key));
        let pub_key = ecc::compute_public_key(priv_key, false).unwrap();
        assert!(!search_file(&filename, &pub_key));
    }
}
